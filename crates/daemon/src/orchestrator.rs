//! The site orchestrator: one control loop driving every backup site.
//!
//! The loop owns all per-site state. Background tasks (workers, streamers,
//! basebackup jobs, the directory watcher) only report back through queues,
//! shared activity markers and oneshot completion channels.

use crate::alert::{Alert, AlertSink};
use crate::error::{SiteError, SiteResult};
use crate::pg::{ClusterProbe, PgProbe};
use crate::producer::{BasebackupProducer, PgBaseBackup};
use crate::queue::PipelineQueues;
use crate::retention::RetentionEngine;
use crate::scheduler::{BasebackupScheduler, SchedulerAction};
use crate::state::{SiteRuntimeState, StateSnapshot, build_snapshot, write_json_file};
use crate::streamer::{LogStreamer, PgReceiveWal, StreamerSupervisor};
use crate::watcher::DirectoryWatcher;
use crate::workers::{WorkerPool, spawn_compressors, spawn_transfer_agents};
use archivist_core::config::{AppConfig, SiteConfig};
use archivist_core::layout::SitePaths;
use archivist_storage::ObjectStore;
use futures::FutureExt;
use rand::seq::IndexedRandom;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Requests delivered to the control loop between ticks.
#[derive(Debug)]
pub enum ControlMessage {
    /// Replace the configuration.
    Reload(Box<AppConfig>),
    /// Take a basebackup of the site on the next tick.
    RequestBasebackup(String),
}

/// External systems the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn ObjectStore>,
    pub producer: Arc<dyn BasebackupProducer>,
    pub streamer: Arc<dyn LogStreamer>,
    pub probe: Arc<dyn ClusterProbe>,
}

impl Collaborators {
    /// PostgreSQL client tools and a sqlx probe.
    pub fn postgres(config: &AppConfig, storage: Arc<dyn ObjectStore>) -> Self {
        Self {
            storage,
            producer: Arc::new(PgBaseBackup::new(config.tools.pg_basebackup_path.clone())),
            streamer: Arc::new(PgReceiveWal::new(config.tools.pg_receivewal_path.clone())),
            probe: Arc::new(PgProbe::default()),
        }
    }
}

/// Cloneable control surface of a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    control: mpsc::UnboundedSender<ControlMessage>,
    shutdown: CancellationToken,
    lifecycle: watch::Receiver<Lifecycle>,
}

impl OrchestratorHandle {
    /// Ask for a basebackup of `site`. Returns false if the loop is gone.
    pub fn request_basebackup(&self, site: impl Into<String>) -> bool {
        self.control
            .send(ControlMessage::RequestBasebackup(site.into()))
            .is_ok()
    }

    /// Hand a new configuration to the loop. Returns false if the loop is gone.
    pub fn reload(&self, config: AppConfig) -> bool {
        self.control
            .send(ControlMessage::Reload(Box::new(config)))
            .is_ok()
    }

    /// Begin an orderly shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Wait until the orchestrator reaches `target`.
    pub async fn wait_for(&mut self, target: Lifecycle) {
        let _ = self.lifecycle.wait_for(|state| *state == target).await;
    }
}

pub struct Orchestrator {
    config: Arc<AppConfig>,
    collaborators: Collaborators,
    sites: BTreeMap<String, SiteRuntimeState>,
    queues: PipelineQueues,
    scheduler: BasebackupScheduler,
    supervisor: StreamerSupervisor,
    watcher: DirectoryWatcher,
    alerts: AlertSink,
    compressors: Option<WorkerPool>,
    transfer_agents: Option<WorkerPool>,
    watcher_task: Option<JoinHandle<()>>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    shutdown: CancellationToken,
    workers_cancel: CancellationToken,
    lifecycle: watch::Sender<Lifecycle>,
    startup_time: OffsetDateTime,
    last_snapshot: Option<Instant>,
}

fn build_scheduler(
    config: &AppConfig,
    collaborators: &Collaborators,
    queues: &PipelineQueues,
) -> BasebackupScheduler {
    BasebackupScheduler::new(
        RetentionEngine::new(collaborators.storage.clone(), config.path_prefix.clone()),
        collaborators.producer.clone(),
        collaborators.probe.clone(),
        queues.compression.clone(),
        config.orchestrator.listing_refresh(),
    )
}

impl Orchestrator {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> (Self, OrchestratorHandle) {
        let queues = PipelineQueues::new();
        let watcher = DirectoryWatcher::new(
            queues.compression.clone(),
            config.orchestrator.watch_poll_interval(),
        );
        let scheduler = build_scheduler(&config, &collaborators, &queues);
        let supervisor = StreamerSupervisor::new(
            collaborators.streamer.clone(),
            collaborators.probe.clone(),
            watcher.clone(),
        );
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Starting);
        let shutdown = CancellationToken::new();

        let handle = OrchestratorHandle {
            control: control_tx,
            shutdown: shutdown.clone(),
            lifecycle: lifecycle_rx,
        };
        let orchestrator = Self {
            alerts: AlertSink::new(config.alert_dir()),
            config: Arc::new(config),
            collaborators,
            sites: BTreeMap::new(),
            queues,
            scheduler,
            supervisor,
            watcher,
            compressors: None,
            transfer_agents: None,
            watcher_task: None,
            control_rx,
            shutdown,
            workers_cancel: CancellationToken::new(),
            lifecycle: lifecycle_tx,
            startup_time: OffsetDateTime::now_utc(),
            last_snapshot: None,
        };
        (orchestrator, handle)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn queues(&self) -> &PipelineQueues {
        &self.queues
    }

    pub fn site_state(&self, site: &str) -> Option<&SiteRuntimeState> {
        self.sites.get(site)
    }

    pub fn site_state_mut(&mut self, site: &str) -> Option<&mut SiteRuntimeState> {
        self.sites.get_mut(site)
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        tracing::info!(?lifecycle, "Orchestrator lifecycle changed");
        self.lifecycle.send_replace(lifecycle);
    }

    /// Prepare every site and start the background tasks.
    pub async fn start(&mut self) -> SiteResult<()> {
        let sites: Vec<String> = self.config.backup_sites.keys().cloned().collect();
        for site in sites {
            self.add_site(&site).await?;
        }

        let compressors =
            spawn_compressors(&self.config, &self.queues, self.workers_cancel.clone());
        let transfer_agents = spawn_transfer_agents(
            &self.config,
            self.collaborators.storage.clone(),
            &self.queues,
            self.workers_cancel.clone(),
        );
        tracing::info!(
            compressors = compressors.len(),
            transfer_agents = transfer_agents.len(),
            sites = self.sites.len(),
            "Workers started"
        );
        self.compressors = Some(compressors);
        self.transfer_agents = Some(transfer_agents);
        self.watcher_task = Some(self.watcher.clone().spawn(self.workers_cancel.clone()));

        self.set_lifecycle(Lifecycle::Running);
        Ok(())
    }

    /// Create the site's directories and start watching its incoming WAL.
    ///
    /// Watching right away picks up files written while the daemon was down.
    async fn add_site(&mut self, site: &str) -> SiteResult<()> {
        let paths = SitePaths::new(&self.config.backup_location, &self.config.path_prefix, site);
        for dir in paths.all() {
            tokio::fs::create_dir_all(dir).await?;
        }
        self.watcher.watch(site, &paths.xlog_incoming).await;
        self.sites
            .insert(site.to_string(), SiteRuntimeState::new(site, paths));
        Ok(())
    }

    /// Run until shutdown is requested, then stop.
    pub async fn run(mut self) -> SiteResult<()> {
        self.start().await?;

        let shutdown = self.shutdown.clone();
        let mut period = self.config.orchestrator.tick_interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }

            let configured = self.config.orchestrator.tick_interval();
            if configured != period {
                period = configured;
                interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            }
        }

        self.stop().await;
        Ok(())
    }

    /// One pass of the control loop.
    pub async fn tick(&mut self) {
        self.drain_control().await;

        let config = self.config.clone();
        let now = OffsetDateTime::now_utc();
        for (site, site_config) in &config.backup_sites {
            if !site_config.active {
                continue;
            }
            let Some(state) = self.sites.get_mut(site) else {
                continue;
            };

            let result = AssertUnwindSafe(handle_site(
                &self.scheduler,
                &self.supervisor,
                site_config,
                state,
                now,
            ))
            .catch_unwind()
            .await;

            match result {
                Ok(outcome) => {
                    if let Err(e) = outcome.streamer {
                        self.report_error(site, "streamer", &e).await;
                    }
                    match outcome.scheduler {
                        Ok(SchedulerAction::None) => {}
                        Ok(action) => tracing::debug!(site = %site, ?action, "Scheduler acted"),
                        Err(e) => self.report_error(site, "scheduler", &e).await,
                    }
                }
                Err(panic) => {
                    tracing::error!(
                        site = %site,
                        panic = %panic_message(panic.as_ref()),
                        "Site handling panicked"
                    );
                }
            }
        }

        let due = self
            .last_snapshot
            .is_none_or(|at| at.elapsed() >= self.config.orchestrator.state_snapshot_interval());
        if due {
            self.write_snapshot().await;
        }
    }

    async fn report_error(&self, site: &str, stage: &'static str, error: &SiteError) {
        tracing::error!(site = %site, stage, code = error.code(), error = %error, "Site error");
        if let Some(alert) = error.alert() {
            self.alerts.raise(alert).await;
        }
    }

    async fn drain_control(&mut self) {
        while let Ok(message) = self.control_rx.try_recv() {
            match message {
                ControlMessage::RequestBasebackup(site) => match self.sites.get_mut(&site) {
                    Some(state) => {
                        tracing::info!(site = %site, "Basebackup requested");
                        state.request_basebackup();
                    }
                    None => tracing::warn!(site = %site, "Basebackup requested for unknown site"),
                },
                ControlMessage::Reload(config) => self.reload(*config).await,
            }
        }
    }

    /// Switch to `config`. An invalid configuration leaves the current one in place.
    ///
    /// Storage, local paths, worker settings and tool paths are fixed for the life of
    /// the process; changes to them are ignored with a warning.
    async fn reload(&mut self, mut config: AppConfig) {
        if let Err(e) = config.validate() {
            tracing::error!(error = %e, "Rejected configuration reload");
            self.alerts.raise(Alert::Configuration).await;
            return;
        }

        let current = self.config.clone();
        if config.backup_location != current.backup_location
            || config.path_prefix != current.path_prefix
            || config.storage != current.storage
            || config.compression != current.compression
            || config.transfer != current.transfer
            || config.tools != current.tools
        {
            tracing::warn!("Storage, path, worker and tool settings only change on restart");
        }
        config.backup_location = current.backup_location.clone();
        config.path_prefix = current.path_prefix.clone();
        config.storage = current.storage.clone();
        config.compression = current.compression.clone();
        config.transfer = current.transfer.clone();
        config.tools = current.tools.clone();

        let removed: Vec<String> = self
            .sites
            .keys()
            .filter(|site| !config.backup_sites.contains_key(*site))
            .cloned()
            .collect();
        let timeout = config.orchestrator.shutdown_timeout();
        for site in removed {
            if let Some(state) = self.sites.remove(&site) {
                tracing::info!(site = %site, "Site removed");
                stop_site(state, timeout).await;
                self.watcher.unwatch_site(&site).await;
            }
        }

        self.alerts = AlertSink::new(config.alert_dir());
        self.config = Arc::new(config);
        self.scheduler = build_scheduler(&self.config, &self.collaborators, &self.queues);

        let added: Vec<String> = self
            .config
            .backup_sites
            .keys()
            .filter(|site| !self.sites.contains_key(*site))
            .cloned()
            .collect();
        for site in added {
            match self.add_site(&site).await {
                Ok(()) => tracing::info!(site = %site, "Site added"),
                Err(e) => self.report_error(&site, "reload", &e).await,
            }
        }
        tracing::info!(sites = self.sites.len(), "Configuration reloaded");
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> StateSnapshot {
        build_snapshot(
            self.startup_time,
            &self.sites,
            self.compressors
                .as_ref()
                .map(WorkerPool::snapshot)
                .unwrap_or_default(),
            self.transfer_agents
                .as_ref()
                .map(WorkerPool::snapshot)
                .unwrap_or_default(),
            &self.queues,
        )
    }

    async fn write_snapshot(&mut self) {
        let snapshot = self.snapshot();
        let path = &self.config.json_state_file_path;
        if let Err(e) = write_json_file(path, &snapshot).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write state file");
        }
        self.last_snapshot = Some(Instant::now());
    }

    /// Stop every background task, waiting a bounded time for each.
    pub async fn stop(&mut self) {
        self.set_lifecycle(Lifecycle::Stopping);
        self.workers_cancel.cancel();
        let timeout = self.config.orchestrator.shutdown_timeout();

        for state in self.sites.values() {
            if let Some(job) = &state.in_flight_basebackup {
                job.stop();
            }
            if let Some(streamer) = &state.streamer_handle {
                streamer.stop();
            }
        }
        for state in self.sites.values_mut() {
            if let Some(job) = state.in_flight_basebackup.take()
                && !job.join(timeout).await
            {
                tracing::warn!(site = %state.site, "Basebackup job did not stop in time");
            }
            if let Some(streamer) = state.streamer_handle.take()
                && !streamer.join(timeout).await
            {
                tracing::warn!(site = %state.site, "Log streamer did not stop in time");
            }
        }

        if let Some(task) = self.watcher_task.take()
            && tokio::time::timeout(timeout, task).await.is_err()
        {
            tracing::warn!("Directory watcher did not stop in time");
        }
        for (name, pool) in [
            ("compressors", self.compressors.as_mut()),
            ("transfer_agents", self.transfer_agents.as_mut()),
        ] {
            if let Some(pool) = pool {
                let stuck = pool.join(timeout).await;
                if stuck > 0 {
                    tracing::warn!(pool = name, stuck, "Workers did not stop in time");
                }
            }
        }

        self.write_snapshot().await;
        self.set_lifecycle(Lifecycle::Stopped);
    }
}

/// Results of handling one site for one tick.
struct SiteOutcome {
    streamer: SiteResult<bool>,
    scheduler: SiteResult<SchedulerAction>,
}

async fn handle_site(
    scheduler: &BasebackupScheduler,
    supervisor: &StreamerSupervisor,
    config: &SiteConfig,
    state: &mut SiteRuntimeState,
    now: OffsetDateTime,
) -> SiteOutcome {
    let node = config.nodes.choose(&mut rand::rng()).cloned();
    let Some(node) = node else {
        let error = || SiteError::Config(format!("site {} has no nodes", state.site));
        return SiteOutcome {
            streamer: Err(error()),
            scheduler: Err(error()),
        };
    };

    let streamer = supervisor.ensure_running(config, &node, state).await;
    let scheduler = scheduler.tick(config, &node, state, now).await;
    SiteOutcome {
        streamer,
        scheduler,
    }
}

async fn stop_site(mut state: SiteRuntimeState, timeout: Duration) {
    if let Some(job) = state.in_flight_basebackup.take() {
        job.stop();
        job.join(timeout).await;
    }
    if let Some(streamer) = state.streamer_handle.take() {
        streamer.stop();
        streamer.join(timeout).await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
