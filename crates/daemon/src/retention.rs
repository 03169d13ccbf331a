//! Basebackup retention and WAL pruning.
//!
//! The remote listing is authoritative: every evaluation re-reads it, keeps
//! the newest `basebackup_count` records and deletes the rest together with
//! the WAL that only they needed.

use archivist_core::basebackup::sort_by_start_time;
use archivist_core::{BasebackupRecord, SegmentId, layout};
use archivist_storage::{ObjectStore, StorageResult};
use std::sync::Arc;
use time::OffsetDateTime;

/// Result of one retention evaluation.
#[derive(Clone, Debug, Default)]
pub struct RetentionOutcome {
    /// Surviving records, oldest first.
    pub kept: Vec<BasebackupRecord>,
    /// Records deleted this pass, oldest first.
    pub pruned: Vec<BasebackupRecord>,
    /// Records dropped from the retained set whose object could not be
    /// deleted. They show up again on the next listing.
    pub failed: Vec<BasebackupRecord>,
    /// Start time of the newest surviving record.
    pub latest_backup_time: Option<OffsetDateTime>,
}

/// Why the WAL deletion walk stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalkStop {
    /// Reached log 0, segment 0 on the current timeline.
    StartOfHistory,
    /// No more segments to delete at this position.
    NotFound(SegmentId),
    /// A delete failed for a reason other than the segment being absent.
    Error { segment: SegmentId, error: String },
}

/// Result of one WAL deletion walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalDeletion {
    /// Segments deleted, newest first.
    pub deleted: Vec<SegmentId>,
    pub stop: WalkStop,
}

/// Applies the retention policy of one site against object storage.
#[derive(Clone)]
pub struct RetentionEngine {
    storage: Arc<dyn ObjectStore>,
    path_prefix: String,
}

impl RetentionEngine {
    pub fn new(storage: Arc<dyn ObjectStore>, path_prefix: impl Into<String>) -> Self {
        Self {
            storage,
            path_prefix: path_prefix.into(),
        }
    }

    /// List a site's basebackups, oldest first.
    ///
    /// Objects whose metadata cannot be parsed are logged and left out.
    pub async fn list_basebackups(&self, site: &str) -> StorageResult<Vec<BasebackupRecord>> {
        let prefix = layout::remote_basebackup_prefix(&self.path_prefix, site);
        let objects = self.storage.list_path(&prefix).await?;

        let mut records: Vec<BasebackupRecord> = objects
            .iter()
            .filter_map(|object| {
                match BasebackupRecord::from_metadata(object.basename(), &object.metadata) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::warn!(site, key = %object.name, error = %e, "Ignoring unparsable basebackup");
                        None
                    }
                }
            })
            .collect();
        sort_by_start_time(&mut records);
        Ok(records)
    }

    /// Re-list the site and prune down to `basebackup_count` records.
    ///
    /// Pruning goes oldest first. For each pruned record the WAL older than
    /// the next surviving record's starting segment is deleted before the
    /// basebackup object itself.
    pub async fn evaluate(
        &self,
        site: &str,
        basebackup_count: usize,
    ) -> StorageResult<RetentionOutcome> {
        let mut kept = self.list_basebackups(site).await?;
        let mut pruned = Vec::new();
        let mut failed = Vec::new();

        while kept.len() > basebackup_count {
            let oldest = kept.remove(0);
            // Loop condition guarantees a survivor when count >= 1
            let Some(next) = kept.first() else {
                kept.insert(0, oldest);
                break;
            };

            tracing::info!(
                site,
                basebackup = %oldest.name,
                boundary = %next.start_wal_segment,
                "Pruning basebackup"
            );
            let walk = self.delete_wal_before(site, next.start_wal_segment).await;
            tracing::info!(
                site,
                deleted = walk.deleted.len(),
                stop = ?walk.stop,
                "WAL pruning finished"
            );

            let key = layout::remote_basebackup_key(&self.path_prefix, site, &oldest.name);
            match self.storage.delete_key(&key).await {
                Ok(()) => pruned.push(oldest),
                Err(e) if e.is_not_found() => {
                    tracing::warn!(site, key = %key, "Basebackup already gone");
                    pruned.push(oldest);
                }
                Err(e) => {
                    tracing::error!(site, key = %key, error = %e, "Failed to delete basebackup");
                    failed.push(oldest);
                }
            }
        }

        Ok(RetentionOutcome {
            latest_backup_time: kept.last().map(|r| r.start_time),
            kept,
            pruned,
            failed,
        })
    }

    /// Delete WAL segments strictly older than `boundary`.
    ///
    /// Walks backwards from `boundary`. When a segment is missing on a
    /// timeline above 1 the walk retries the same position on the parent
    /// timeline once; a second miss, or any miss on timeline 1, ends it.
    /// Storage errors other than not-found end the walk and are logged.
    pub async fn delete_wal_before(&self, site: &str, boundary: SegmentId) -> WalDeletion {
        let mut deleted = Vec::new();
        let mut current = boundary;
        let mut valid_timeline = true;

        loop {
            if valid_timeline {
                match current.previous_on_timeline() {
                    Some(previous) => current = previous,
                    None => {
                        return WalDeletion {
                            deleted,
                            stop: WalkStop::StartOfHistory,
                        };
                    }
                }
            }

            let key = layout::remote_wal_key(&self.path_prefix, site, &current.name());
            match self.storage.delete_key(&key).await {
                Ok(()) => {
                    tracing::debug!(site, segment = %current, "Deleted WAL segment");
                    deleted.push(current);
                    valid_timeline = true;
                }
                Err(e) if e.is_not_found() => {
                    let parent = if valid_timeline {
                        current.decrement_timeline()
                    } else {
                        None
                    };
                    match parent {
                        Some(parent) => {
                            tracing::debug!(site, from = %current, to = %parent, "Switching to parent timeline");
                            current = parent;
                            valid_timeline = false;
                        }
                        None => {
                            return WalDeletion {
                                deleted,
                                stop: WalkStop::NotFound(current),
                            };
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(site, segment = %current, error = %e, "Failed to delete WAL segment");
                    return WalDeletion {
                        deleted,
                        stop: WalkStop::Error {
                            segment: current,
                            error: e.to_string(),
                        },
                    };
                }
            }
        }
    }
}
