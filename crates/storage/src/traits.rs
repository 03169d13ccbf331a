//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

/// String metadata stored alongside an object.
pub type ObjectMetadata = BTreeMap<String, String>;

/// An entry returned by [`ObjectStore::list_path`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedObject {
    /// Full object key.
    pub name: String,
    /// Object size in bytes.
    pub size: u64,
    /// Metadata written with the object.
    pub metadata: ObjectMetadata,
}

impl ListedObject {
    /// Last path component of the key.
    pub fn basename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Object store abstraction used by the backup daemon.
///
/// Deleting a missing object must fail with
/// [`StorageError::NotFound`](crate::StorageError::NotFound) so callers can
/// tell "already gone" apart from real failures.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// List objects directly under a prefix, in no particular order.
    async fn list_path(&self, prefix: &str) -> StorageResult<Vec<ListedObject>>;

    /// Store an object and its metadata atomically.
    async fn put(&self, key: &str, data: Bytes, metadata: ObjectMetadata) -> StorageResult<()>;

    /// Delete an object.
    async fn delete_key(&self, key: &str) -> StorageResult<()>;

    /// Get the name of this storage backend.
    ///
    /// Used for logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called once at startup so misconfigured storage fails fast. The default
    /// implementation returns Ok(()).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
