use crate::{DurableStore, LOCK_KEY, StoreError, StoreResult, validate_key};
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

/// In-memory store. Clones share state, so a clone kept across two
/// environments behaves like a durable store surviving a reload.
#[derive(Clone, Default)]
pub struct MemStore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("entries", &self.entries.read().unwrap().len())
            .finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemStore {
    fn list(&self) -> StoreResult<Vec<String>> {
        let guard = self.entries.read().unwrap();
        Ok(guard.keys().filter(|k| *k != LOCK_KEY).cloned().collect())
    }

    fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        validate_key(key)?;
        let guard = self.entries.read().unwrap();
        guard.get(key).cloned().ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })
    }

    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        let mut guard = self.entries.write().unwrap();
        guard.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    fn contains(&self, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        Ok(self.entries.read().unwrap().contains_key(key))
    }
}
