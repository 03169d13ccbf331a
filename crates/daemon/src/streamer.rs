//! Continuous WAL streaming and its supervision.

use crate::error::{SiteError, SiteResult};
use crate::pg::{self, ClusterProbe, SLOT_SUPPORT_VERSION};
use crate::state::{Activity, SiteRuntimeState};
use crate::watcher::DirectoryWatcher;
use archivist_core::config::{NodeConfig, SiteConfig};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Parameters for one streaming process.
#[derive(Clone, Debug)]
pub struct StreamerRequest {
    pub site: String,
    pub node: NodeConfig,
    /// Where completed segments are written.
    pub target_dir: PathBuf,
    /// Replication slot, only set when the server supports slots.
    pub slot: Option<String>,
    pub server_version: u32,
    pub client_version: u32,
}

/// Handle to a running log streamer.
pub struct StreamerHandle {
    cancel: CancellationToken,
    activity: Arc<Activity>,
    task: Option<JoinHandle<()>>,
}

impl StreamerHandle {
    pub fn new(cancel: CancellationToken, activity: Arc<Activity>) -> Self {
        Self {
            cancel,
            activity,
            task: None,
        }
    }

    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Whether the streamer is still alive.
    pub fn is_running(&self) -> bool {
        self.activity.is_running() && !self.task.as_ref().is_some_and(|t| t.is_finished())
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait up to `timeout` for the streamer to exit. Returns whether it did.
    pub async fn join(mut self, timeout: Duration) -> bool {
        match self.task.take() {
            Some(task) => tokio::time::timeout(timeout, task).await.is_ok(),
            None => true,
        }
    }
}

/// Starts log streamers.
#[async_trait]
pub trait LogStreamer: Send + Sync {
    /// Version of the streaming tool, in `server_version_num` form.
    async fn tool_version(&self) -> SiteResult<u32>;

    async fn launch(&self, request: StreamerRequest) -> SiteResult<StreamerHandle>;
}

/// Streamer running `pg_receivewal`.
pub struct PgReceiveWal {
    path: PathBuf,
}

impl PgReceiveWal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn command(&self, request: &StreamerRequest) -> Command {
        let mut command = Command::new(&self.path);
        command
            .arg("--dbname")
            .arg(request.node.connection_string())
            .arg("--status-interval")
            .arg("1")
            .arg("--verbose")
            .arg("--directory")
            .arg(&request.target_dir);
        if let Some(slot) = &request.slot {
            command.arg("--slot").arg(slot);
        }
        if let Some(password) = &request.node.password {
            command.env("PGPASSWORD", password);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl LogStreamer for PgReceiveWal {
    async fn tool_version(&self) -> SiteResult<u32> {
        pg::tool_version("pg_receivewal", &self.path).await
    }

    async fn launch(&self, request: StreamerRequest) -> SiteResult<StreamerHandle> {
        tokio::fs::create_dir_all(&request.target_dir).await?;
        let mut child = self
            .command(&request)
            .spawn()
            .map_err(|e| SiteError::Launch {
                what: "pg_receivewal",
                reason: format!("{}: {e}", self.path.display()),
            })?;
        tracing::info!(
            site = %request.site,
            host = %request.node.host,
            slot = ?request.slot,
            "Started pg_receivewal"
        );

        let cancel = CancellationToken::new();
        let activity = Arc::new(Activity::started());
        let handle = StreamerHandle::new(cancel.clone(), activity.clone());
        let stderr = child.stderr.take();
        let site = request.site;

        let task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let activity = activity.clone();
                let site = site.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        activity.touch();
                        tracing::debug!(site = %site, "pg_receivewal: {}", line);
                    }
                });
            }

            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => tracing::warn!(site = %site, %status, "pg_receivewal exited"),
                    Err(e) => tracing::error!(site = %site, error = %e, "Waiting for pg_receivewal failed"),
                },
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(site = %site, error = %e, "Failed to kill pg_receivewal");
                    }
                    tracing::info!(site = %site, "pg_receivewal stopped");
                }
            }
            activity.set_stopped();
        });

        Ok(handle.with_task(task))
    }
}

/// Keeps one log streamer alive per streaming site.
pub struct StreamerSupervisor {
    streamer: Arc<dyn LogStreamer>,
    probe: Arc<dyn ClusterProbe>,
    watcher: DirectoryWatcher,
}

impl StreamerSupervisor {
    pub fn new(
        streamer: Arc<dyn LogStreamer>,
        probe: Arc<dyn ClusterProbe>,
        watcher: DirectoryWatcher,
    ) -> Self {
        Self {
            streamer,
            probe,
            watcher,
        }
    }

    /// Start a streamer for the site unless one is already running.
    ///
    /// Returns whether a new streamer was started. Sites not in streaming
    /// mode are left alone. A streamer that has exited is replaced.
    pub async fn ensure_running(
        &self,
        config: &SiteConfig,
        node: &NodeConfig,
        state: &mut SiteRuntimeState,
    ) -> SiteResult<bool> {
        if !config.active_backup_mode.requires_streaming() {
            return Ok(false);
        }
        if let Some(handle) = &state.streamer_handle {
            if handle.is_running() {
                return Ok(false);
            }
            tracing::warn!(site = %state.site, "Log streamer is no longer running, restarting");
            state.streamer_handle = None;
        }

        let server_version = self.probe.server_version(node).await?;
        let client_version = self.streamer.tool_version().await?;
        pg::check_versions("pg_receivewal", server_version, client_version)?;

        let slot = match &node.slot {
            Some(slot) if server_version >= SLOT_SUPPORT_VERSION => Some(slot.clone()),
            Some(slot) => {
                tracing::warn!(site = %state.site, slot = %slot, server_version, "Server too old for replication slots, streaming without");
                None
            }
            None => None,
        };

        let target_dir = state.paths.xlog_incoming.clone();
        self.watcher.watch(&state.site, &target_dir).await;

        let handle = self
            .streamer
            .launch(StreamerRequest {
                site: state.site.clone(),
                node: node.clone(),
                target_dir,
                slot,
                server_version,
                client_version,
            })
            .await?;
        state.streamer_handle = Some(handle);
        Ok(true)
    }
}
