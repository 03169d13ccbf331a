//! Basebackup jobs.
//!
//! A job runs in the background and reports a single [`BasebackupOutcome`]
//! through a oneshot channel. The control loop polls the channel without
//! blocking; a job that drops its sender without reporting counts as failed.

use crate::error::{SiteError, SiteResult};
use crate::pg::{self, WAL_RENAME_VERSION};
use crate::queue::WorkQueue;
use crate::state::Activity;
use archivist_core::basebackup::basebackup_metadata;
use archivist_core::config::NodeConfig;
use archivist_core::{SegmentId, WorkItem};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Label passed to the server for every basebackup.
const BACKUP_LABEL: &str = "archivist_base_backup";

/// Everything a producer needs to take one basebackup.
#[derive(Clone, Debug)]
pub struct BasebackupRequest {
    pub site: String,
    pub node: NodeConfig,
    /// Segment the server was writing when the backup was requested.
    pub start_wal_segment: SegmentId,
    /// Directory the job may write into.
    pub output_dir: PathBuf,
    /// Version of the basebackup tool.
    pub client_version: u32,
}

/// How a job ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasebackupOutcome {
    pub success: bool,
    /// Name of the produced backup on success.
    pub backup_name: Option<String>,
    pub error: Option<String>,
}

impl BasebackupOutcome {
    pub fn succeeded(backup_name: impl Into<String>) -> Self {
        Self {
            success: true,
            backup_name: Some(backup_name.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            backup_name: None,
            error: Some(error.into()),
        }
    }
}

/// Result of polling a job.
#[derive(Debug)]
pub enum JobPoll {
    Pending,
    Complete(BasebackupOutcome),
}

/// Handle to a running basebackup job.
pub struct BasebackupJob {
    completion: oneshot::Receiver<BasebackupOutcome>,
    cancel: CancellationToken,
    activity: Arc<Activity>,
    task: Option<JoinHandle<()>>,
}

/// Reporting half handed to whatever runs the job.
pub struct JobReporter {
    completion: oneshot::Sender<BasebackupOutcome>,
    cancel: CancellationToken,
    activity: Arc<Activity>,
}

impl BasebackupJob {
    /// A job with no task attached yet, and its reporter.
    pub fn pending() -> (Self, JobReporter) {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let activity = Arc::new(Activity::started());
        (
            Self {
                completion: rx,
                cancel: cancel.clone(),
                activity: activity.clone(),
                task: None,
            },
            JobReporter {
                completion: tx,
                cancel,
                activity,
            },
        )
    }

    /// Attach the task driving this job so shutdown can join it.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Check for completion without blocking.
    pub fn poll(&mut self) -> JobPoll {
        match self.completion.try_recv() {
            Ok(outcome) => JobPoll::Complete(outcome),
            Err(TryRecvError::Empty) => JobPoll::Pending,
            Err(TryRecvError::Closed) => {
                JobPoll::Complete(BasebackupOutcome::failed("job ended without reporting"))
            }
        }
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Ask the job to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait up to `timeout` for the job's task. Returns whether it finished.
    pub async fn join(mut self, timeout: Duration) -> bool {
        match self.task.take() {
            Some(task) => tokio::time::timeout(timeout, task).await.is_ok(),
            None => true,
        }
    }
}

impl JobReporter {
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn activity(&self) -> Arc<Activity> {
        self.activity.clone()
    }

    /// Report the outcome. The job is no longer running afterwards.
    pub fn complete(self, outcome: BasebackupOutcome) {
        self.activity.set_stopped();
        // The receiver is gone only if the site was removed
        let _ = self.completion.send(outcome);
    }
}

/// Launches basebackup jobs.
#[async_trait]
pub trait BasebackupProducer: Send + Sync {
    /// Version of the basebackup tool, in `server_version_num` form.
    async fn tool_version(&self) -> SiteResult<u32>;

    /// Start a job. Produced files are pushed onto `compression_queue`.
    ///
    /// The job completes only after its files have been uploaded.
    async fn launch(
        &self,
        request: BasebackupRequest,
        compression_queue: WorkQueue,
    ) -> SiteResult<BasebackupJob>;
}

/// Producer running `pg_basebackup` in tar format.
pub struct PgBaseBackup {
    path: PathBuf,
}

impl PgBaseBackup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn command(&self, request: &BasebackupRequest, work_dir: &Path) -> Command {
        let mut command = Command::new(&self.path);
        command
            .arg("--format")
            .arg("tar")
            .arg("--label")
            .arg(BACKUP_LABEL)
            .arg("--progress")
            .arg("--verbose")
            .arg("--pgdata")
            .arg(work_dir)
            .arg("--dbname")
            .arg(request.node.connection_string());
        if request.client_version >= WAL_RENAME_VERSION {
            command.arg("--wal-method=none");
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

/// Name of a backup started at `start_time`, e.g. `2024-05-01_12-30-00`.
pub fn backup_name(start_time: OffsetDateTime) -> SiteResult<String> {
    start_time
        .format(format_description!(
            "[year]-[month]-[day]_[hour]-[minute]-[second]"
        ))
        .map_err(|e| SiteError::Unexpected(format!("cannot format backup name: {e}")))
}

#[async_trait]
impl BasebackupProducer for PgBaseBackup {
    async fn tool_version(&self) -> SiteResult<u32> {
        pg::tool_version("pg_basebackup", &self.path).await
    }

    async fn launch(
        &self,
        request: BasebackupRequest,
        compression_queue: WorkQueue,
    ) -> SiteResult<BasebackupJob> {
        let start_time = OffsetDateTime::now_utc();
        let name = backup_name(start_time)?;
        let work_dir = request.output_dir.join(format!("{name}.incoming"));
        tokio::fs::create_dir_all(&work_dir).await?;

        let mut child = self
            .command(&request, &work_dir)
            .spawn()
            .map_err(|e| SiteError::Launch {
                what: "pg_basebackup",
                reason: format!("{}: {e}", self.path.display()),
            })?;
        tracing::info!(
            site = %request.site,
            host = %request.node.host,
            backup = %name,
            start_wal_segment = %request.start_wal_segment,
            "Started pg_basebackup"
        );

        let (job, reporter) = BasebackupJob::pending();
        let activity = reporter.activity();
        let cancel = reporter.cancellation();
        let stderr = child.stderr.take();

        let task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let activity = activity.clone();
                let site = request.site.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        activity.touch();
                        tracing::debug!(site = %site, "pg_basebackup: {}", line);
                    }
                });
            }

            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    reporter.complete(BasebackupOutcome::failed("cancelled"));
                    return;
                }
            };

            let outcome = match status {
                Ok(status) if status.success() => {
                    match finish_backup(&request, &work_dir, &name, start_time, &compression_queue)
                        .await
                    {
                        Ok(uploaded) => {
                            tokio::select! {
                                result = uploaded => upload_outcome(name, result),
                                _ = cancel.cancelled() => BasebackupOutcome::failed("cancelled"),
                            }
                        }
                        Err(e) => BasebackupOutcome::failed(e.to_string()),
                    }
                }
                Ok(status) => BasebackupOutcome::failed(format!("pg_basebackup exited with {status}")),
                Err(e) => BasebackupOutcome::failed(format!("waiting for pg_basebackup: {e}")),
            };
            if !outcome.success {
                let _ = tokio::fs::remove_dir_all(&work_dir).await;
            }
            reporter.complete(outcome);
        });

        Ok(job.with_task(task))
    }
}

/// Outcome of a job once its tarball has gone through the pipeline.
fn upload_outcome(
    name: String,
    result: Result<Result<(), String>, oneshot::error::RecvError>,
) -> BasebackupOutcome {
    match result {
        Ok(Ok(())) => BasebackupOutcome::succeeded(name),
        Ok(Err(e)) => BasebackupOutcome::failed(format!("{name}: {e}")),
        Err(_) => BasebackupOutcome::failed(format!("{name}: upload abandoned")),
    }
}

/// Move the finished tarball into place and queue it for compression.
///
/// The returned receiver resolves once the tarball is in object storage.
async fn finish_backup(
    request: &BasebackupRequest,
    work_dir: &Path,
    name: &str,
    start_time: OffsetDateTime,
    compression_queue: &WorkQueue,
) -> SiteResult<oneshot::Receiver<Result<(), String>>> {
    let mut tarballs = Vec::new();
    let mut entries = tokio::fs::read_dir(work_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        tarballs.push(entry.file_name().to_string_lossy().into_owned());
    }
    if tarballs != ["base.tar"] {
        return Err(SiteError::Unexpected(format!(
            "expected only base.tar, found {tarballs:?}; tablespaces are not supported"
        )));
    }

    let target = request.output_dir.join(name);
    tokio::fs::rename(work_dir.join("base.tar"), &target).await?;
    tokio::fs::remove_dir(work_dir).await?;

    let metadata = basebackup_metadata(start_time, request.start_wal_segment)?;
    let (uploaded_tx, uploaded_rx) = oneshot::channel();
    compression_queue
        .push(WorkItem::basebackup(&request.site, target, metadata).with_completion(uploaded_tx));
    Ok(uploaded_rx)
}
