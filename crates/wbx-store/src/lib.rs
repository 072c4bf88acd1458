//! Durable key/value backends that the content cache mirrors its mounted subtree into.

mod fs_store;
mod mem_store;

pub use fs_store::FsStore;
pub use mem_store::MemStore;

use std::{io, path::PathBuf, sync::Arc};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynStore = Arc<dyn DurableStore>;

/// Marker written while a flush is in progress. A leftover one means the
/// previous session died mid-flush.
pub const LOCK_KEY: &str = ".wbx-sync.lock";

/// Trait implemented by all durable stores.
///
/// Keys are relative, `/`-separated paths. The lock marker is never
/// reported by [`DurableStore::list`].
pub trait DurableStore: Send + Sync {
    fn list(&self) -> StoreResult<Vec<String>>;
    fn read(&self, key: &str) -> StoreResult<Vec<u8>>;
    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;
    fn remove(&self, key: &str) -> StoreResult<()>;
    fn contains(&self, key: &str) -> StoreResult<bool>;

    fn set_lock(&self) -> StoreResult<()> {
        self.write(LOCK_KEY, b"")
    }

    fn release_lock(&self) -> StoreResult<()> {
        self.remove(LOCK_KEY)
    }

    fn is_locked(&self) -> StoreResult<bool> {
        self.contains(LOCK_KEY)
    }

    /// Remove a lock left behind by an aborted flush. Returns whether one was found.
    fn clear_stale_lock(&self) -> StoreResult<bool> {
        if self.is_locked()? {
            tracing::warn!("removing stale sync lock from an aborted flush");
            self.release_lock()?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid store key '{key}'")]
    InvalidKey { key: String },
    #[error("store entry '{key}' not found")]
    NotFound { key: String },
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

/// Reject keys that could escape the store root.
pub fn validate_key(key: &str) -> StoreResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key("abc").is_ok());
        assert!(validate_key("dir/abc").is_ok());
        for bad in ["", "/abs", "a//b", "../up", "a/./b", "a\\b", "trailing/"] {
            assert!(validate_key(bad).is_err(), "{bad} should be rejected");
        }
    }
}
