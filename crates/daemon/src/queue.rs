//! Ordered work queues between producers and worker pools.

use archivist_core::WorkItem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};

/// Unbounded FIFO queue shared by any number of producers and workers.
///
/// Each item is handed to exactly one `pop` caller.
#[derive(Clone)]
pub struct WorkQueue {
    name: &'static str,
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    depth: Arc<AtomicUsize>,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue an item.
    pub fn push(&self, item: WorkItem) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.tx.send(item) {
            // Only possible once the receiving half is gone
            self.depth.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(
                queue = self.name,
                path = %err.0.source_path.display(),
                "Queue closed, dropping work item"
            );
        }
    }

    /// Wait for the next item.
    ///
    /// Cancel safe: dropping the future never loses an item.
    pub async fn pop(&self) -> Option<WorkItem> {
        let mut rx = self.rx.lock().await;
        let item = rx.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Take the next item if one is ready.
    pub fn try_pop(&self) -> Option<WorkItem> {
        let mut rx = self.rx.try_lock().ok()?;
        let item = rx.try_recv().ok();
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The two pipeline stages.
#[derive(Clone)]
pub struct PipelineQueues {
    pub compression: WorkQueue,
    pub transfer: WorkQueue,
}

impl PipelineQueues {
    pub fn new() -> Self {
        Self {
            compression: WorkQueue::new("compression"),
            transfer: WorkQueue::new("transfer"),
        }
    }
}

impl Default for PipelineQueues {
    fn default() -> Self {
        Self::new()
    }
}
