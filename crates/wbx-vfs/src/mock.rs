//! Test fixtures: an in-memory fetcher and pack builders.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::FetchError;
use crate::remote::Fetcher;

/// Serves registered URLs, answers 404 for everything else, and counts
/// every fetch per URL.
#[derive(Debug, Default)]
pub struct MockFetcher {
    assets: Mutex<HashMap<String, Bytes>>,
    counts: Mutex<HashMap<String, usize>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, bytes: impl Into<Bytes>) {
        self.assets.lock().unwrap().insert(url.into(), bytes.into());
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.counts.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.counts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        *self.counts.lock().unwrap().entry(url.to_string()).or_default() += 1;
        self.assets
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

/// Build a tar pack. Names ending in `/` become directories.
pub fn tar_pack(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(if name.ends_with('/') {
            tar::EntryType::Directory
        } else {
            tar::EntryType::Regular
        });
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *data)
            .expect("append pack entry");
    }
    builder.into_inner().expect("finalize pack")
}

pub fn brotli_compress(bytes: &[u8]) -> Vec<u8> {
    let mut writer = brotli::CompressorWriter::new(Vec::new(), 4096, 11, 22);
    writer.write_all(bytes).expect("compress");
    writer.into_inner()
}
