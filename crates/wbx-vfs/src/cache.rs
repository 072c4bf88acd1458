//! Content-addressed cache: a durable-backed subtree of the shared tree
//! holding one file per digest.
//!
//! The subtree is the in-session view; [`ContentCache::pull`] and
//! [`ContentCache::push`] reconcile it with the durable store. Both must be
//! awaited before anything trusts `has`/`get` or inspects the store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use wbx_cbor::Digest;
use wbx_store::{DurableStore, DynStore, StoreResult, validate_key};

use crate::error::{SyncError, VfsError, VfsResult};
use crate::mount::MountPolicy;
use crate::path::{join, normalize, split_parent};
use crate::remote::{LoadedHook, RemoteDescriptor};
use crate::tree::Vfs;

pub struct ContentCache {
    root: String,
    store: DynStore,
    /// Relative path → node version last written to or read from the store.
    synced: Mutex<BTreeMap<String, u64>>,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("root", &self.root)
            .finish()
    }
}

impl ContentCache {
    /// Attach the cache at `root`.
    ///
    /// A fresh root is created, mounted as the durable prefix and pulled.
    /// An existing root is assumed to be durable-backed already and is left
    /// alone. Any stale sync lock in the store is cleared first.
    pub async fn open(vfs: &Vfs, root: &str, store: DynStore) -> VfsResult<Self> {
        let root = normalize(root)?;
        let cache = Self {
            root,
            store,
            synced: Mutex::new(BTreeMap::new()),
        };
        let store = cache.store.clone();
        run_blocking(move || store.clear_stale_lock()).await?;

        if vfs.exists(&cache.root) {
            tracing::debug!(root = %cache.root, "cache root exists, skipping mount");
            return Ok(cache);
        }
        vfs.mkdir_tree(&cache.root)?;
        vfs.mount(&cache.root, MountPolicy::Durable)?;
        cache.pull(vfs).await?;
        Ok(cache)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn entry_path(&self, digest: &Digest) -> String {
        join(&self.root, digest.as_str())
    }

    pub fn has(&self, vfs: &Vfs, digest: &Digest) -> bool {
        vfs.exists(&self.entry_path(digest))
    }

    pub fn get(&self, vfs: &Vfs, digest: &Digest) -> VfsResult<Bytes> {
        match vfs.read_loaded(&self.entry_path(digest)) {
            Err(err) if err.is_not_found() => Err(VfsError::CacheMiss {
                digest: digest.clone(),
            }),
            other => other,
        }
    }

    /// Store `bytes` under `digest`. Entries never change once written, so
    /// a put for an existing digest does nothing.
    pub fn put(&self, vfs: &Vfs, digest: &Digest, bytes: Bytes) -> VfsResult<()> {
        let path = self.entry_path(digest);
        if vfs.exists(&path) {
            return Ok(());
        }
        vfs.write_file(&path, bytes)
    }

    /// Make the cache subtree mirror the durable store.
    pub async fn pull(&self, vfs: &Vfs) -> VfsResult<()> {
        let store = self.store.clone();
        let entries = run_blocking(move || {
            store
                .list()?
                .into_iter()
                .map(|key| {
                    let bytes = store.read(&key)?;
                    Ok((key, bytes))
                })
                .collect::<StoreResult<Vec<_>>>()
        })
        .await?;

        let remote: BTreeSet<&str> = entries.iter().map(|(key, _)| key.as_str()).collect();
        for (rel, _) in vfs.walk_files(&self.root)? {
            if !remote.contains(rel.as_str()) {
                vfs.unlink(&join(&self.root, &rel))?;
            }
        }

        let mut synced = BTreeMap::new();
        for (key, bytes) in entries {
            let path = join(&self.root, &key);
            if let Some((parent, _)) = split_parent(&path) {
                vfs.mkdir_tree(parent)?;
            }
            vfs.write_file(&path, bytes)?;
            synced.insert(key, vfs.stat(&path)?.version);
        }
        tracing::debug!(root = %self.root, entries = synced.len(), "pulled durable store");
        *self.synced.lock().expect("cache sync state poisoned") = synced;
        Ok(())
    }

    /// Flush files written or removed since the last sync into the durable store.
    pub async fn push(&self, vfs: &Vfs) -> VfsResult<()> {
        let local = vfs.walk_files(&self.root)?;
        let (changed, removed) = {
            let synced = self.synced.lock().expect("cache sync state poisoned");
            let mut changed = Vec::new();
            for (rel, meta) in &local {
                if synced.get(rel) == Some(&meta.version) {
                    continue;
                }
                if !meta.loaded {
                    tracing::debug!(path = %rel, "skipping unmaterialized file in cache");
                    continue;
                }
                if let Err(err) = validate_key(rel) {
                    tracing::warn!(path = %rel, "not flushing cache file: {err}");
                    continue;
                }
                let bytes = vfs.read_loaded(&join(&self.root, rel))?;
                changed.push((rel.clone(), meta.version, bytes));
            }
            let present: BTreeSet<&str> = local.iter().map(|(rel, _)| rel.as_str()).collect();
            let removed: Vec<String> = synced
                .keys()
                .filter(|key| !present.contains(key.as_str()))
                .cloned()
                .collect();
            (changed, removed)
        };
        if changed.is_empty() && removed.is_empty() {
            return Ok(());
        }

        let store = self.store.clone();
        let writes: Vec<(String, Bytes)> = changed
            .iter()
            .map(|(rel, _, bytes)| (rel.clone(), bytes.clone()))
            .collect();
        let deletes = removed.clone();
        run_blocking(move || {
            store.set_lock()?;
            for (key, bytes) in &writes {
                store.write(key, bytes)?;
            }
            for key in &deletes {
                store.remove(key)?;
            }
            store.release_lock()
        })
        .await?;

        let mut synced = self.synced.lock().expect("cache sync state poisoned");
        for (rel, version, _) in changed {
            synced.insert(rel, version);
        }
        for key in removed {
            synced.remove(&key);
        }
        tracing::debug!(root = %self.root, entries = synced.len(), "pushed to durable store");
        Ok(())
    }
}

/// Fills the cache when a lazily-fetched file arrives, then flushes.
pub(crate) struct CacheFill {
    pub(crate) cache: Arc<ContentCache>,
}

#[async_trait]
impl LoadedHook for CacheFill {
    async fn on_loaded(
        &self,
        vfs: &Vfs,
        descriptor: &RemoteDescriptor,
        bytes: &Bytes,
    ) -> VfsResult<()> {
        self.cache.put(vfs, &descriptor.digest, bytes.clone())?;
        self.cache.push(vfs).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| SyncError::Task(err.to_string()))?
        .map_err(SyncError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wbx_store::{LOCK_KEY, MemStore};

    async fn open(vfs: &Vfs, store: &MemStore) -> ContentCache {
        ContentCache::open(vfs, "/cache/", Arc::new(store.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_get_survives_new_session() {
        let store = MemStore::new();
        let digest = Digest::sha256_of(b"libc");

        let vfs = Vfs::new();
        let cache = open(&vfs, &store).await;
        assert_eq!(cache.root(), "/cache");
        assert!(!cache.has(&vfs, &digest));
        assert!(matches!(
            cache.get(&vfs, &digest),
            Err(VfsError::CacheMiss { .. })
        ));
        cache.put(&vfs, &digest, Bytes::from_static(b"libc")).unwrap();
        cache.push(&vfs).await.unwrap();
        assert_eq!(store.read(digest.as_str()).unwrap(), b"libc");

        let next_session = Vfs::new();
        let cache = open(&next_session, &store).await;
        assert!(cache.has(&next_session, &digest));
        assert_eq!(cache.get(&next_session, &digest).unwrap(), "libc");
        assert_eq!(
            next_session.durable_mount().as_deref(),
            Some("/cache")
        );
    }

    #[tokio::test]
    async fn put_existing_digest_is_noop() {
        let store = MemStore::new();
        let vfs = Vfs::new();
        let cache = open(&vfs, &store).await;
        let digest = Digest::sha256_of(b"a");
        cache.put(&vfs, &digest, Bytes::from_static(b"a")).unwrap();
        let version = vfs.stat(&cache.entry_path(&digest)).unwrap().version;
        cache.put(&vfs, &digest, Bytes::from_static(b"a")).unwrap();
        assert_eq!(
            vfs.stat(&cache.entry_path(&digest)).unwrap().version,
            version
        );
    }

    #[tokio::test]
    async fn push_flushes_only_changes_and_deletions() {
        let store = MemStore::new();
        let vfs = Vfs::new();
        let cache = open(&vfs, &store).await;
        vfs.mkdir_tree("/cache/sysroot").unwrap();
        vfs.write_file("/cache/sysroot/libc.a", "v1").unwrap();
        vfs.write_file("/cache/keep", "k").unwrap();
        cache.push(&vfs).await.unwrap();
        assert_eq!(store.list().unwrap(), vec!["keep", "sysroot/libc.a"]);

        vfs.write_file("/cache/sysroot/libc.a", "v2").unwrap();
        vfs.unlink("/cache/keep").unwrap();
        cache.push(&vfs).await.unwrap();
        assert_eq!(store.list().unwrap(), vec!["sysroot/libc.a"]);
        assert_eq!(store.read("sysroot/libc.a").unwrap(), b"v2");
        assert!(!store.contains(LOCK_KEY).unwrap());
    }

    #[tokio::test]
    async fn unstorable_name_does_not_block_push() {
        let store = MemStore::new();
        let vfs = Vfs::new();
        let cache = open(&vfs, &store).await;
        vfs.write_file("/cache/a\\b", "bad").unwrap();
        cache.push(&vfs).await.unwrap();
        assert!(!store.is_locked().unwrap());

        vfs.write_file("/cache/good", "g").unwrap();
        cache.push(&vfs).await.unwrap();
        assert_eq!(store.list().unwrap(), vec!["good"]);
        assert!(!store.is_locked().unwrap());
    }

    #[tokio::test]
    async fn pull_mirrors_store_and_drops_unknown_files() {
        let store = MemStore::new();
        store.write("remote", b"r").unwrap();
        let vfs = Vfs::new();
        let cache = open(&vfs, &store).await;
        assert_eq!(vfs.read_loaded("/cache/remote").unwrap(), "r");

        vfs.write_file("/cache/local-only", "l").unwrap();
        cache.pull(&vfs).await.unwrap();
        assert!(!vfs.exists("/cache/local-only"));
        assert!(vfs.exists("/cache/remote"));
    }

    #[tokio::test]
    async fn open_clears_stale_lock_and_skips_existing_root() {
        let store = MemStore::new();
        store.set_lock().unwrap();
        store.write("entry", b"e").unwrap();

        let vfs = Vfs::new();
        vfs.mkdir_tree("/cache").unwrap();
        let cache = open(&vfs, &store).await;
        assert!(!store.is_locked().unwrap());
        // Existing root: no mount, no pull.
        assert!(vfs.durable_mount().is_none());
        assert!(!vfs.exists("/cache/entry"));
        assert_eq!(cache.root(), "/cache");
    }
}
