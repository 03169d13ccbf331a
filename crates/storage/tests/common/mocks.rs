use archivist_storage::error::{StorageError, StorageResult};
use archivist_storage::traits::{ListedObject, ObjectMetadata, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Wraps a backend, counting calls and failing deletes of chosen keys.
#[allow(dead_code)]
pub struct InstrumentedBackend<S> {
    inner: S,
    pub list_calls: AtomicUsize,
    pub put_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    failing_deletes: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl<S: ObjectStore> InstrumentedBackend<S> {
    pub fn new(inner: S) -> Arc<Self> {
        Arc::new(Self {
            inner,
            list_calls: AtomicUsize::new(0),
            put_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            failing_deletes: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_delete_of(&self, key: &str) {
        self.failing_deletes.lock().unwrap().insert(key.to_string());
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for InstrumentedBackend<S> {
    async fn list_path(&self, prefix: &str) -> StorageResult<Vec<ListedObject>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list_path(prefix).await
    }

    async fn put(&self, key: &str, data: Bytes, metadata: ObjectMetadata) -> StorageResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, data, metadata).await
    }

    async fn delete_key(&self, key: &str) -> StorageResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_deletes.lock().unwrap().contains(key) {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "injected failure deleting {key}"
            ))));
        }
        self.inner.delete_key(key).await
    }

    fn backend_name(&self) -> &'static str {
        "instrumented"
    }
}
