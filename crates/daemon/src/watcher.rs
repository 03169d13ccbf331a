//! Watches streamer output directories for completed WAL files.
//!
//! Directories are polled. A file is forwarded once, the first time it is
//! seen under a completed-segment or timeline-history name; `.partial`
//! files and anything else are ignored until renamed.

use crate::queue::WorkQueue;
use archivist_core::WorkItem;
use archivist_core::wal::{is_timeline_history_file_name, is_wal_file_name};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct WatchedDir {
    site: String,
    seen: HashSet<String>,
}

/// Polling watcher feeding the compression queue.
#[derive(Clone)]
pub struct DirectoryWatcher {
    dirs: Arc<Mutex<BTreeMap<PathBuf, WatchedDir>>>,
    queue: WorkQueue,
    poll_interval: Duration,
}

impl DirectoryWatcher {
    pub fn new(queue: WorkQueue, poll_interval: Duration) -> Self {
        Self {
            dirs: Arc::new(Mutex::new(BTreeMap::new())),
            queue,
            poll_interval,
        }
    }

    /// Start watching `dir` for `site`. Watching a directory twice is a no-op.
    pub async fn watch(&self, site: &str, dir: &Path) {
        let mut dirs = self.dirs.lock().await;
        if !dirs.contains_key(dir) {
            tracing::debug!(site, dir = %dir.display(), "Watching directory");
            dirs.insert(
                dir.to_path_buf(),
                WatchedDir {
                    site: site.to_string(),
                    seen: HashSet::new(),
                },
            );
        }
    }

    /// Stop watching every directory of `site`.
    pub async fn unwatch_site(&self, site: &str) {
        self.dirs.lock().await.retain(|_, watched| watched.site != site);
    }

    pub async fn watched_dirs(&self) -> Vec<PathBuf> {
        self.dirs.lock().await.keys().cloned().collect()
    }

    /// Scan every watched directory once. Returns the number of files queued.
    pub async fn scan_once(&self) -> usize {
        let mut dirs = self.dirs.lock().await;
        let mut queued = 0;

        for (dir, watched) in dirs.iter_mut() {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to scan directory");
                    continue;
                }
            };

            let mut present = HashSet::new();
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "Directory scan interrupted");
                        break;
                    }
                };
                let name = entry.file_name().to_string_lossy().into_owned();
                if !is_wal_file_name(&name) && !is_timeline_history_file_name(&name) {
                    continue;
                }
                if !entry.file_type().await.is_ok_and(|t| t.is_file()) {
                    continue;
                }

                if !watched.seen.contains(&name) {
                    tracing::debug!(site = %watched.site, file = %name, "New WAL file");
                    self.queue
                        .push(WorkItem::wal_segment(&watched.site, entry.path()));
                    watched.seen.insert(name.clone());
                    queued += 1;
                }
                present.insert(name);
            }

            // Forget files that are gone so the set stays bounded
            watched.seen.retain(|name| present.contains(name));
        }

        queued
    }

    /// Poll until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.scan_once().await;
                    }
                }
            }
            tracing::debug!("Directory watcher stopped");
        })
    }
}
