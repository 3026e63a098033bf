pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryKeyValueStore;
pub use sqlite::SqliteKeyValueStore;

/// Durable string-keyed record storage.
///
/// Calls are synchronous so callers on a UI thread can mirror every mutation
/// without awaiting. Implementations decide how that maps onto their backend.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}

pub(crate) fn validate_key(key: &str, stage: &'static str) -> StorageResult<()> {
    if key.trim().is_empty() {
        return error::InvalidKeySnafu {
            stage,
            key: key.to_string(),
            details: "key must not be blank",
        }
        .fail();
    }

    Ok(())
}
