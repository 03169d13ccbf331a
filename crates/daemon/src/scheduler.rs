//! Basebackup scheduling.

use crate::error::SiteResult;
use crate::pg::{self, ClusterProbe};
use crate::producer::{BasebackupOutcome, BasebackupProducer, BasebackupRequest, JobPoll};
use crate::queue::WorkQueue;
use crate::retention::RetentionEngine;
use crate::state::SiteRuntimeState;
use archivist_core::config::{NodeConfig, SiteConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// What a scheduler tick did.
#[derive(Debug, PartialEq, Eq)]
pub enum SchedulerAction {
    None,
    /// A new job was started for the site.
    Launch(String),
    /// A finished job was collected.
    Reap(BasebackupOutcome),
}

/// Why a basebackup is due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupReason {
    Requested,
    NeverBackedUp,
    IntervalElapsed,
}

/// Decide whether a new basebackup is due.
///
/// Consumes a pending request. Callers must not ask while a job is in flight.
pub fn backup_due(
    config: &SiteConfig,
    state: &mut SiteRuntimeState,
    now: OffsetDateTime,
) -> Option<BackupReason> {
    if state.take_basebackup_request() {
        return Some(BackupReason::Requested);
    }
    match state.last_basebackup_time {
        None => Some(BackupReason::NeverBackedUp),
        Some(last) if now - last >= config.basebackup_interval() => {
            Some(BackupReason::IntervalElapsed)
        }
        Some(_) => None,
    }
}

/// Drives basebackups and retention for every site.
pub struct BasebackupScheduler {
    retention: RetentionEngine,
    producer: Arc<dyn BasebackupProducer>,
    probe: Arc<dyn ClusterProbe>,
    compression_queue: WorkQueue,
    listing_refresh: Duration,
}

impl BasebackupScheduler {
    pub fn new(
        retention: RetentionEngine,
        producer: Arc<dyn BasebackupProducer>,
        probe: Arc<dyn ClusterProbe>,
        compression_queue: WorkQueue,
        listing_refresh: Duration,
    ) -> Self {
        Self {
            retention,
            producer,
            probe,
            compression_queue,
            listing_refresh,
        }
    }

    /// Re-list remote basebackups and apply retention.
    pub async fn refresh_listing(
        &self,
        config: &SiteConfig,
        state: &mut SiteRuntimeState,
    ) -> SiteResult<()> {
        let outcome = self
            .retention
            .evaluate(&state.site, config.basebackup_count)
            .await?;
        if !outcome.pruned.is_empty() {
            tracing::info!(
                site = %state.site,
                pruned = outcome.pruned.len(),
                kept = outcome.kept.len(),
                "Retention pruned basebackups"
            );
        }
        state.apply_retention(outcome, Instant::now());
        Ok(())
    }

    /// Advance the site's basebackup schedule by one step.
    pub async fn tick(
        &self,
        config: &SiteConfig,
        node: &NodeConfig,
        state: &mut SiteRuntimeState,
        now: OffsetDateTime,
    ) -> SiteResult<SchedulerAction> {
        if state.listing_due(self.listing_refresh, Instant::now()) {
            self.refresh_listing(config, state).await?;
        }

        if let Some(job) = state.in_flight_basebackup.as_mut() {
            let outcome = match job.poll() {
                JobPoll::Pending => return Ok(SchedulerAction::None),
                JobPoll::Complete(outcome) => outcome,
            };
            state.in_flight_basebackup = None;

            if outcome.success {
                tracing::info!(site = %state.site, backup = ?outcome.backup_name, "Basebackup finished");
            } else {
                tracing::error!(site = %state.site, error = ?outcome.error, "Basebackup failed");
            }
            if let Err(e) = self.refresh_listing(config, state).await {
                tracing::error!(site = %state.site, error = %e, "Failed to refresh basebackups after job");
                state.last_check_time = None;
            }
            return Ok(SchedulerAction::Reap(outcome));
        }

        let Some(reason) = backup_due(config, state, now) else {
            return Ok(SchedulerAction::None);
        };
        tracing::info!(site = %state.site, host = %node.host, ?reason, "Starting basebackup");

        let server_version = self.probe.server_version(node).await?;
        let client_version = self.producer.tool_version().await?;
        pg::check_versions("pg_basebackup", server_version, client_version)?;
        let start_wal_segment = self.probe.current_wal_segment(node, server_version).await?;

        let job = self
            .producer
            .launch(
                BasebackupRequest {
                    site: state.site.clone(),
                    node: node.clone(),
                    start_wal_segment,
                    output_dir: state.paths.basebackup_incoming.clone(),
                    client_version,
                },
                self.compression_queue.clone(),
            )
            .await?;
        state.in_flight_basebackup = Some(job);
        Ok(SchedulerAction::Launch(state.site.clone()))
    }
}
