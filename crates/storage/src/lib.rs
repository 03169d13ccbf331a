//! Object storage abstraction and backends for Archivist.
//!
//! This crate provides:
//! - The minimal list/put/delete contract the daemon relies on
//! - A distinguishable not-found error for idempotent deletes
//! - A local filesystem backend storing metadata in sidecar files

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use error::{StorageError, StorageResult};
pub use traits::{ListedObject, ObjectMetadata, ObjectStore};

use archivist_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
    }
}
