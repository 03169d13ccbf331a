//! Compression and transfer worker pools.
//!
//! Each worker takes one item at a time from its queue. Cancellation is
//! only observed between items, so an item in progress always finishes.

use crate::compression::compress_file;
use crate::error::{SiteError, SiteResult};
use crate::queue::{PipelineQueues, WorkQueue};
use crate::state::Activity;
use archivist_core::config::{AppConfig, CompressionConfig};
use archivist_core::layout::{self, SitePaths};
use archivist_core::{META_COMPRESSION, META_ORIGINAL_SIZE, WorkItem, report_completion};
use archivist_storage::ObjectStore;
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Counters of one worker.
#[derive(Debug)]
pub struct WorkerStats {
    name: String,
    processed: AtomicU64,
    failed: AtomicU64,
    activity: Activity,
}

impl WorkerStats {
    fn new(name: String) -> Self {
        Self {
            name,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            activity: Activity::started(),
        }
    }

    fn record(&self, ok: bool) {
        if ok {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.activity.touch();
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            name: self.name.clone(),
            running: self.activity.is_running(),
            items_processed: self.processed.load(Ordering::Relaxed),
            items_failed: self.failed.load(Ordering::Relaxed),
            latest_activity: self.activity.latest_activity(),
        }
    }
}

/// Worker status as it appears in the state file.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerSnapshot {
    pub name: String,
    pub running: bool,
    pub items_processed: u64,
    pub items_failed: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub latest_activity: Option<OffsetDateTime>,
}

/// A set of workers draining one queue.
pub struct WorkerPool {
    stats: Vec<Arc<WorkerStats>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn spawn<F, Fut>(
        kind: &'static str,
        count: usize,
        queue: WorkQueue,
        cancel: CancellationToken,
        handler: F,
    ) -> Self
    where
        F: Fn(WorkItem) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = SiteResult<()>> + Send + 'static,
    {
        let mut stats = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let worker = Arc::new(WorkerStats::new(format!("{kind}-{index}")));
            let queue = queue.clone();
            let cancel = cancel.clone();
            let handler = handler.clone();
            let stats_ref = worker.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        item = queue.pop() => item,
                    };
                    let Some(item) = item else { break };
                    let path = item.source_path.clone();
                    let site = item.site.clone();

                    match handler(item).await {
                        Ok(()) => stats_ref.record(true),
                        Err(e) => {
                            stats_ref.record(false);
                            tracing::error!(
                                worker = %stats_ref.name,
                                site = %site,
                                path = %path.display(),
                                error = %e,
                                "Work item failed"
                            );
                        }
                    }
                }
                stats_ref.activity.set_stopped();
                tracing::debug!(worker = %stats_ref.name, "Worker stopped");
            }));
            stats.push(worker);
        }

        Self { stats, handles }
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.stats.iter().map(|s| s.snapshot()).collect()
    }

    /// Number of workers not yet joined.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait up to `timeout` for all workers. Returns how many did not finish.
    pub async fn join(&mut self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut stuck = 0;
        for handle in self.handles.drain(..) {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                stuck += 1;
            }
        }
        stuck
    }
}

/// Settings shared by compression workers.
#[derive(Clone)]
struct CompressionContext {
    algorithm: CompressionConfig,
    backup_location: PathBuf,
    path_prefix: String,
    transfer: WorkQueue,
}

/// Spawn the compression workers.
pub fn spawn_compressors(
    config: &AppConfig,
    queues: &PipelineQueues,
    cancel: CancellationToken,
) -> WorkerPool {
    let context = Arc::new(CompressionContext {
        algorithm: config.compression.algorithm,
        backup_location: config.backup_location.clone(),
        path_prefix: config.path_prefix.clone(),
        transfer: queues.transfer.clone(),
    });

    WorkerPool::spawn(
        "compressor",
        config.compression.thread_count,
        queues.compression.clone(),
        cancel,
        move |mut item| {
            let context = context.clone();
            let completion = item.take_completion();
            async move {
                let result = compress_item(
                    item,
                    context.algorithm,
                    &context.backup_location,
                    &context.path_prefix,
                )
                .await;
                match result {
                    Ok(mut compressed) => {
                        compressed.completion = completion;
                        context.transfer.push(compressed);
                        Ok(())
                    }
                    Err(e) => {
                        report_completion(completion, Err(format!("compression failed: {e}")));
                        Err(e)
                    }
                }
            }
        },
    )
}

/// Spawn the transfer workers.
pub fn spawn_transfer_agents(
    config: &AppConfig,
    storage: Arc<dyn ObjectStore>,
    queues: &PipelineQueues,
    cancel: CancellationToken,
) -> WorkerPool {
    let path_prefix: Arc<str> = Arc::from(config.path_prefix.as_str());

    WorkerPool::spawn(
        "transfer",
        config.transfer.thread_count,
        queues.transfer.clone(),
        cancel,
        move |item| {
            let storage = storage.clone();
            let path_prefix = path_prefix.clone();
            async move { transfer_item(item, storage.as_ref(), &path_prefix).await }
        },
    )
}

/// Compress one file into the site's outgoing directory.
///
/// Returns the item to hand to the transfer stage.
pub async fn compress_item(
    item: WorkItem,
    algorithm: CompressionConfig,
    backup_location: &std::path::Path,
    path_prefix: &str,
) -> SiteResult<WorkItem> {
    let name = item
        .file_name()
        .ok_or_else(|| SiteError::Unexpected(format!("no file name in {:?}", item.source_path)))?;
    let paths = SitePaths::new(backup_location, path_prefix, &item.site);
    let target = paths.compressed_dir(item.kind).join(&name);

    let sizes = compress_file(algorithm, &item.source_path, &target).await?;
    tracing::debug!(
        site = %item.site,
        file = %name,
        algorithm = algorithm.as_str(),
        original_size = sizes.original_size,
        compressed_size = sizes.compressed_size,
        "Compressed file"
    );

    if item.delete_source_after_success {
        tokio::fs::remove_file(&item.source_path).await?;
    }

    let mut metadata = item.metadata;
    metadata.insert(META_COMPRESSION.to_string(), algorithm.as_str().to_string());
    metadata.insert(META_ORIGINAL_SIZE.to_string(), sizes.original_size.to_string());

    Ok(WorkItem {
        site: item.site,
        source_path: target,
        kind: item.kind,
        delete_source_after_success: true,
        metadata,
        completion: item.completion,
    })
}

/// Upload one compressed file and remove the local copy.
///
/// The item's completion fires as soon as the object is stored.
pub async fn transfer_item(
    mut item: WorkItem,
    storage: &dyn ObjectStore,
    path_prefix: &str,
) -> SiteResult<()> {
    let completion = item.take_completion();
    let uploaded = async {
        let name = item.file_name().ok_or_else(|| {
            SiteError::Unexpected(format!("no file name in {:?}", item.source_path))
        })?;
        let key = layout::remote_key_for(path_prefix, &item.site, item.kind, &name);
        let data = tokio::fs::read(&item.source_path).await?;
        let size = data.len();
        storage
            .put(&key, Bytes::from(data), std::mem::take(&mut item.metadata))
            .await?;
        Ok::<_, SiteError>((key, size))
    }
    .await;

    let (key, size) = match uploaded {
        Ok(uploaded) => {
            report_completion(completion, Ok(()));
            uploaded
        }
        Err(e) => {
            report_completion(completion, Err(format!("upload failed: {e}")));
            return Err(e);
        }
    };
    tracing::info!(site = %item.site, key = %key, size, kind = item.kind.as_str(), "Uploaded file");

    if item.delete_source_after_success {
        tokio::fs::remove_file(&item.source_path).await?;
    }
    Ok(())
}
