//! Local filesystem storage backend.
//!
//! Objects are plain files under the root. Metadata lives in a JSON sidecar
//! next to each object (`<key>.metadata`), which listings skip.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ListedObject, ObjectMetadata, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Suffix of metadata sidecar files.
const METADATA_SUFFIX: &str = ".metadata";

/// Marker embedded in temporary file names during atomic writes.
const TEMP_MARKER: &str = ".tmp.";

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the full path for a key, rejecting anything that could escape the root.
    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }

        for component in Path::new(key).components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "contains unsafe path component: {key}"
                    )));
                }
            }
        }

        Ok(self.root.join(key))
    }

    /// Keys that would collide with sidecar or temp files are not objects.
    fn object_key_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.ends_with(METADATA_SUFFIX) || key.contains(TEMP_MARKER) {
            return Err(StorageError::InvalidKey(format!(
                "reserved object name: {key}"
            )));
        }
        self.key_path(key)
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(METADATA_SUFFIX);
        PathBuf::from(name)
    }

    /// Write `data` to `path` through a uniquely named temp file, fsync, then rename.
    async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Unique temp name avoids clashes between concurrent writers of one key
        let temp_name = format!("{TEMP_MARKER}{}", Uuid::new_v4());
        let temp_path = path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or_else(|| temp_name.clone()),
        );
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn read_metadata(key: &str, path: &Path) -> StorageResult<ObjectMetadata> {
        match fs::read(Self::sidecar_path(path)).await {
            Ok(raw) => {
                serde_json::from_slice(&raw).map_err(|e| StorageError::InvalidMetadata {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ObjectMetadata::new()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list_path(&self, prefix: &str) -> StorageResult<Vec<ListedObject>> {
        let base_path = self.key_path(prefix)?;
        let mut results = Vec::new();

        let mut entries = match fs::read_dir(&base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let prefix = prefix.trim_end_matches('/');
        while let Some(entry) = entries.next_entry().await? {
            // Use file_type() so symlinks are never followed out of the root
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(METADATA_SUFFIX) || name.contains(TEMP_MARKER) {
                continue;
            }

            let key = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            let path = entry.path();
            let metadata = Self::read_metadata(&key, &path).await?;
            let size = entry.metadata().await?.len();

            results.push(ListedObject {
                name: key,
                size,
                metadata,
            });
        }

        Ok(results)
    }

    #[instrument(skip(self, data, metadata), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, metadata: ObjectMetadata) -> StorageResult<()> {
        let path = self.object_key_path(key)?;
        let sidecar = serde_json::to_vec(&metadata).map_err(|e| StorageError::InvalidMetadata {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        // Sidecar first so a listed object always has its metadata
        Self::write_atomic(&Self::sidecar_path(&path), &sidecar).await?;
        Self::write_atomic(&path, &data).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_key(&self, key: &str) -> StorageResult<()> {
        let path = self.object_key_path(key)?;
        fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;

        match fs::remove_file(Self::sidecar_path(&path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {}", e),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}
