//! Lazily-fetched file content.
//!
//! A [`RemoteBackedFile`] starts out as a bare [`RemoteDescriptor`] and makes a
//! single guarded transition to materialized bytes the first time something
//! needs them. Concurrent first readers share the same fetch.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;
use wbx_cbor::Digest;

use crate::error::{FetchError, VfsResult};
use crate::tree::Vfs;

/// Where a lazy file's bytes come from. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub path: String,
    pub declared_len: u64,
    pub digest: Digest,
    pub url: String,
}

/// Full-body fetch of a remote asset.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

pub type DynFetcher = Arc<dyn Fetcher>;

/// Runs after the bytes arrive and before the file counts as usable. An
/// error here fails the materialization.
#[async_trait]
pub trait LoadedHook: Send + Sync {
    async fn on_loaded(&self, vfs: &Vfs, descriptor: &RemoteDescriptor, bytes: &Bytes)
    -> VfsResult<()>;
}

pub struct RemoteBackedFile {
    descriptor: RemoteDescriptor,
    fetcher: DynFetcher,
    hook: Option<Arc<dyn LoadedHook>>,
    content: OnceCell<Bytes>,
}

impl fmt::Debug for RemoteBackedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBackedFile")
            .field("descriptor", &self.descriptor)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl RemoteBackedFile {
    pub fn new(descriptor: RemoteDescriptor, fetcher: DynFetcher) -> Self {
        Self {
            descriptor,
            fetcher,
            hook: None,
            content: OnceCell::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn LoadedHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn descriptor(&self) -> &RemoteDescriptor {
        &self.descriptor
    }

    pub fn is_loaded(&self) -> bool {
        self.content.initialized()
    }

    /// Length as known without fetching: the real length once loaded,
    /// the declared one before.
    pub fn len(&self) -> u64 {
        match self.content.get() {
            Some(bytes) => bytes.len() as u64,
            None => self.descriptor.declared_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch on first call, then serve the in-memory buffer.
    pub async fn materialize(&self, vfs: &Vfs) -> VfsResult<Bytes> {
        let bytes = self
            .content
            .get_or_try_init(|| async {
                let desc = &self.descriptor;
                tracing::debug!(url = %desc.url, path = %desc.path, "fetching remote file");
                let bytes = self.fetcher.fetch(&desc.url).await?;
                if bytes.len() as u64 != desc.declared_len {
                    tracing::warn!(
                        url = %desc.url,
                        declared = desc.declared_len,
                        actual = bytes.len(),
                        "remote file length differs from declared length"
                    );
                }
                if let Some(hook) = &self.hook {
                    hook.on_loaded(vfs, desc, &bytes).await?;
                }
                Ok::<_, crate::VfsError>(bytes)
            })
            .await?;
        Ok(bytes.clone())
    }
}
