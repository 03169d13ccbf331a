//! Per-site runtime state and the JSON state snapshot.

use crate::producer::BasebackupJob;
use crate::queue::PipelineQueues;
use crate::retention::RetentionOutcome;
use crate::streamer::StreamerHandle;
use crate::workers::WorkerSnapshot;
use archivist_core::BasebackupRecord;
use archivist_core::layout::SitePaths;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::fs;

const NO_ACTIVITY: i64 = i64::MIN;

/// Liveness and last-activity timestamp of a background task.
///
/// Shared between the task and whoever observes it.
#[derive(Debug)]
pub struct Activity {
    running: AtomicBool,
    latest_activity: AtomicI64,
}

impl Activity {
    /// A task that has just been started.
    pub fn started() -> Self {
        let activity = Self {
            running: AtomicBool::new(true),
            latest_activity: AtomicI64::new(NO_ACTIVITY),
        };
        activity.touch();
        activity
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.latest_activity.store(
            OffsetDateTime::now_utc().unix_timestamp(),
            Ordering::Relaxed,
        );
    }

    pub fn set_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn latest_activity(&self) -> Option<OffsetDateTime> {
        match self.latest_activity.load(Ordering::Relaxed) {
            NO_ACTIVITY => None,
            ts => OffsetDateTime::from_unix_timestamp(ts).ok(),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            running: self.is_running(),
            latest_activity: self.latest_activity(),
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            latest_activity: AtomicI64::new(NO_ACTIVITY),
        }
    }
}

/// Everything the control loop tracks for one site between ticks.
pub struct SiteRuntimeState {
    pub site: String,
    pub paths: SitePaths,
    /// Start time of the newest known basebackup.
    pub last_basebackup_time: Option<OffsetDateTime>,
    /// When the remote listing was last refreshed.
    pub last_check_time: Option<Instant>,
    pub in_flight_basebackup: Option<BasebackupJob>,
    pub streamer_handle: Option<StreamerHandle>,
    /// Basebackups from the last listing, oldest first.
    pub known_basebackups: Vec<BasebackupRecord>,
    basebackup_requested: bool,
}

impl SiteRuntimeState {
    pub fn new(site: impl Into<String>, paths: SitePaths) -> Self {
        Self {
            site: site.into(),
            paths,
            last_basebackup_time: None,
            last_check_time: None,
            in_flight_basebackup: None,
            streamer_handle: None,
            known_basebackups: Vec::new(),
            basebackup_requested: false,
        }
    }

    /// Ask for a basebackup on a later tick. Stays set until consumed.
    pub fn request_basebackup(&mut self) {
        self.basebackup_requested = true;
    }

    pub fn basebackup_requested(&self) -> bool {
        self.basebackup_requested
    }

    /// Consume a pending request.
    pub fn take_basebackup_request(&mut self) -> bool {
        std::mem::take(&mut self.basebackup_requested)
    }

    /// Whether the remote listing is older than `refresh`.
    pub fn listing_due(&self, refresh: Duration, now: Instant) -> bool {
        self.last_check_time
            .is_none_or(|checked| now.saturating_duration_since(checked) >= refresh)
    }

    /// Adopt the result of a retention pass.
    pub fn apply_retention(&mut self, outcome: RetentionOutcome, now: Instant) {
        self.last_basebackup_time = outcome.latest_backup_time;
        self.known_basebackups = outcome.kept;
        self.last_check_time = Some(now);
    }

    pub fn snapshot(&self) -> SiteSnapshot {
        SiteSnapshot {
            basebackups: self.known_basebackups.clone(),
            last_basebackup_time: self.last_basebackup_time,
            basebackup_requested: self.basebackup_requested,
            basebackup: self
                .in_flight_basebackup
                .as_ref()
                .map(|job| job.activity().snapshot())
                .unwrap_or_default(),
            streamer: self
                .streamer_handle
                .as_ref()
                .map(|handle| handle.activity().snapshot())
                .unwrap_or_default(),
        }
    }
}

/// Observable status of a background task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub running: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub latest_activity: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SiteSnapshot {
    pub basebackups: Vec<BasebackupRecord>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_basebackup_time: Option<OffsetDateTime>,
    pub basebackup_requested: bool,
    pub basebackup: TaskSnapshot,
    pub streamer: TaskSnapshot,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct QueueDepths {
    pub compression_queue: usize,
    pub transfer_queue: usize,
}

/// Point-in-time view of the whole daemon, written as JSON.
#[derive(Clone, Debug, Serialize)]
pub struct StateSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub startup_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub backup_sites: BTreeMap<String, SiteSnapshot>,
    pub compressors: Vec<WorkerSnapshot>,
    pub transfer_agents: Vec<WorkerSnapshot>,
    pub queues: QueueDepths,
}

/// Assemble a snapshot from the current state.
pub fn build_snapshot(
    startup_time: OffsetDateTime,
    sites: &BTreeMap<String, SiteRuntimeState>,
    compressors: Vec<WorkerSnapshot>,
    transfer_agents: Vec<WorkerSnapshot>,
    queues: &PipelineQueues,
) -> StateSnapshot {
    StateSnapshot {
        startup_time,
        generated_at: OffsetDateTime::now_utc(),
        backup_sites: sites
            .iter()
            .map(|(name, state)| (name.clone(), state.snapshot()))
            .collect(),
        compressors,
        transfer_agents,
        queues: QueueDepths {
            compression_queue: queues.compression.len(),
            transfer_queue: queues.transfer.len(),
        },
    }
}

/// Write `value` as JSON, replacing `path` atomically.
pub async fn write_json_file<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }

    let mut temp = path.as_os_str().to_os_string();
    temp.push(".tmp");
    fs::write(&temp, &data).await?;
    fs::rename(&temp, path).await
}
