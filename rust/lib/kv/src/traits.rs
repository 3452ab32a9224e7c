use crate::error::KVError;

/// KVStore is the engine-agnostic contract of the item store.
///
/// Every call runs in exactly one engine transaction: reads see a committed
/// snapshot, writes either commit entirely or leave the store unchanged.
/// Keys are ordered by their UTF-8 bytes.
pub trait KVStore: Send + Sync {
    /// Get the value for a key. Returns `KVError::NotFound` if the key does not exist.
    fn get(&self, key: &str) -> Result<Vec<u8>, KVError>;

    /// Insert or overwrite a key-value pair.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), KVError>;

    /// Delete a key. Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<(), KVError>;

    /// List keys starting with `prefix` in ascending order. An empty prefix
    /// matches every key. Values are not read.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KVError>;

    /// Release the engine. Any call made afterwards returns `KVError::Closed`.
    fn close(&self) -> Result<(), KVError>;
}
