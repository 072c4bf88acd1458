//! The filesystem surface handed to the host: tree primitives plus the
//! cache-aware operations that tie remote assets, archives and the durable
//! store together.

use std::sync::Arc;

use bytes::Bytes;
use wbx_cbor::Digest;
use wbx_store::DynStore;

use crate::archive::ArchiveUnpacker;
use crate::cache::{CacheFill, ContentCache};
use crate::error::VfsResult;
use crate::mount::MountPolicy;
use crate::path::{normalize, split_parent};
use crate::remote::{DynFetcher, RemoteBackedFile, RemoteDescriptor};
use crate::tree::{Metadata, Vfs};

pub struct VirtualFileSystem {
    vfs: Vfs,
    cache: Arc<ContentCache>,
    fetcher: DynFetcher,
    unpacker: ArchiveUnpacker,
}

impl VirtualFileSystem {
    /// Attach the content cache at `cache_root` (pulling the durable store
    /// if the root is new) and set up native archive handling.
    pub async fn open(
        vfs: Vfs,
        cache_root: &str,
        scratch_dir: &str,
        store: DynStore,
        fetcher: DynFetcher,
    ) -> VfsResult<Self> {
        let cache = ContentCache::open(&vfs, cache_root, store).await?;
        let unpacker = ArchiveUnpacker::native(vfs.clone(), scratch_dir)?;
        tracing::info!(cache_root = %cache.root(), "filesystem ready");
        Ok(Self {
            vfs,
            cache: Arc::new(cache),
            fetcher,
            unpacker,
        })
    }

    /// Swap the archive handling, e.g. for sandboxed brotli/pack tools.
    pub fn with_unpacker(mut self, unpacker: ArchiveUnpacker) -> Self {
        self.unpacker = unpacker;
        self
    }

    pub fn tree(&self) -> &Vfs {
        &self.vfs
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn exists(&self, path: &str) -> bool {
        self.vfs.exists(path)
    }

    pub fn stat(&self, path: &str) -> VfsResult<Metadata> {
        self.vfs.stat(path)
    }

    pub async fn read_file(&self, path: &str) -> VfsResult<Bytes> {
        self.vfs.read_file(path).await
    }

    pub async fn read_file_utf8(&self, path: &str) -> VfsResult<String> {
        self.vfs.read_file_utf8(path).await
    }

    pub fn write_file(&self, path: &str, bytes: impl Into<Bytes>) -> VfsResult<()> {
        self.vfs.write_file(path, bytes)
    }

    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        self.vfs.unlink(path)
    }

    pub fn mkdir_tree(&self, path: &str) -> VfsResult<()> {
        self.vfs.mkdir_tree(path)
    }

    /// Create `path` and back it with the durable store.
    pub fn persist(&self, path: &str) -> VfsResult<()> {
        self.vfs.mkdir_tree(path)?;
        self.vfs.mount(path, MountPolicy::Durable)
    }

    pub async fn pull(&self) -> VfsResult<()> {
        self.cache.pull(&self.vfs).await
    }

    pub async fn push(&self) -> VfsResult<()> {
        self.cache.push(&self.vfs).await
    }

    /// Make `path` hold the asset identified by `digest`.
    ///
    /// A cached copy is used when present; otherwise a lazy file is
    /// registered that fills the cache and pushes on its first read.
    pub async fn cached_lazy_file(
        &self,
        path: &str,
        len: u64,
        digest: &Digest,
        url: &str,
    ) -> VfsResult<()> {
        let path = normalize(path)?;
        if self.vfs.exists(&path) {
            self.vfs.unlink(&path)?;
        }
        if let Some((parent, _)) = split_parent(&path) {
            self.vfs.mkdir_tree(parent)?;
        }

        if self.cache.has(&self.vfs, digest) {
            tracing::debug!(%path, %digest, "cache hit");
            let bytes = self.cache.get(&self.vfs, digest)?;
            return self.vfs.write_file(&path, bytes);
        }

        tracing::debug!(%path, %digest, %url, "cache miss, registering lazy file");
        let descriptor = RemoteDescriptor {
            path: path.clone(),
            declared_len: len,
            digest: digest.clone(),
            url: url.to_string(),
        };
        let file = RemoteBackedFile::new(descriptor, self.fetcher.clone()).with_hook(Arc::new(
            CacheFill {
                cache: self.cache.clone(),
            },
        ));
        self.vfs.insert_lazy(&path, Arc::new(file))
    }

    /// Unpack each archive into `/`, in order. Stops at the first failure.
    pub async fn unpack<S: AsRef<str>>(&self, paths: &[S]) -> VfsResult<()> {
        for path in paths {
            let path = path.as_ref();
            tracing::info!(%path, "unpacking");
            self.unpacker.unpack(path).await?;
        }
        Ok(())
    }

    /// Delete a lock file left behind by a crashed session. Returns whether
    /// one was present.
    pub fn remove_stale_lock(&self, path: &str) -> VfsResult<bool> {
        if !self.vfs.exists(path) {
            return Ok(false);
        }
        tracing::info!(%path, "removing stale lock marker");
        self.vfs.unlink(path)?;
        Ok(true)
    }
}
