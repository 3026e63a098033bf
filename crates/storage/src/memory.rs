use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::error::{LockPoisonedSnafu, StorageResult};
use super::{KeyValueStore, validate_key};

/// Process-local key-value store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| LockPoisonedSnafu { stage }.build())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        validate_key(key, "memory-get")?;
        Ok(self.lock("memory-get")?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        validate_key(key, "memory-set")?;
        self.lock("memory-set")?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        validate_key(key, "memory-remove")?;
        self.lock("memory-remove")?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;

    #[test]
    fn set_get_and_remove_round_trip() {
        let store = MemoryKeyValueStore::new();
        assert_eq!(store.get("conversations").unwrap(), None);

        store.set("conversations", "[]").unwrap();
        assert_eq!(store.get("conversations").unwrap().as_deref(), Some("[]"));

        store.set("conversations", "[1]").unwrap();
        assert_eq!(store.get("conversations").unwrap().as_deref(), Some("[1]"));
        assert_eq!(store.len(), 1);

        store.remove("conversations").unwrap();
        assert!(store.is_empty());
        // Removing an absent key is not an error.
        store.remove("conversations").unwrap();
    }

    #[test]
    fn blank_keys_are_rejected() {
        let store = MemoryKeyValueStore::new();
        let error = store.set("  ", "value").unwrap_err();
        assert!(matches!(error, StorageError::InvalidKey { .. }));
    }
}
