//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("storage.path cannot be empty".to_string())
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// Compression algorithm applied before upload.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionConfig {
    /// No compression.
    None,
    /// Zstd compression (recommended: fast, good ratio).
    #[default]
    Zstd,
    /// XZ compression (slow but high ratio).
    Xz,
}

impl CompressionConfig {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zstd => "zstd",
            Self::Xz => "xz",
        }
    }
}

/// Compression worker pool configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompressionSettings {
    /// Algorithm used for WAL and basebackup files.
    #[serde(default)]
    pub algorithm: CompressionConfig,
    /// Number of compression workers.
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: CompressionConfig::default(),
            thread_count: default_thread_count(),
        }
    }
}

/// Transfer worker pool configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferSettings {
    /// Number of transfer workers.
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
        }
    }
}

fn default_thread_count() -> usize {
    5
}

/// Control loop timing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Interval between control loop ticks in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How often remote basebackups are re-listed per site.
    #[serde(default = "default_listing_refresh_secs")]
    pub listing_refresh_secs: u64,
    /// How often the JSON state snapshot is written.
    #[serde(default = "default_state_snapshot_interval_secs")]
    pub state_snapshot_interval_secs: u64,
    /// Upper bound on waiting for each background task during shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Poll interval of the incoming WAL directory watcher in milliseconds.
    #[serde(default = "default_watch_poll_interval_ms")]
    pub watch_poll_interval_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    5000
}

fn default_listing_refresh_secs() -> u64 {
    60
}

fn default_state_snapshot_interval_secs() -> u64 {
    60
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_watch_poll_interval_ms() -> u64 {
    1000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            listing_refresh_secs: default_listing_refresh_secs(),
            state_snapshot_interval_secs: default_state_snapshot_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            watch_poll_interval_ms: default_watch_poll_interval_ms(),
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn listing_refresh(&self) -> Duration {
        Duration::from_secs(self.listing_refresh_secs)
    }

    pub fn state_snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.state_snapshot_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_interval_ms)
    }

    /// Validate timing values.
    pub fn validate(&self) -> Result<(), String> {
        // tokio::time::interval panics on a zero period
        if self.tick_interval_ms == 0 {
            return Err("orchestrator.tick_interval_ms cannot be 0".to_string());
        }
        if self.watch_poll_interval_ms == 0 {
            return Err("orchestrator.watch_poll_interval_ms cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Paths of the external PostgreSQL tools.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolPaths {
    #[serde(default = "default_pg_basebackup_path")]
    pub pg_basebackup_path: PathBuf,
    #[serde(default = "default_pg_receivewal_path")]
    pub pg_receivewal_path: PathBuf,
}

fn default_pg_basebackup_path() -> PathBuf {
    PathBuf::from("/usr/bin/pg_basebackup")
}

fn default_pg_receivewal_path() -> PathBuf {
    PathBuf::from("/usr/bin/pg_receivewal")
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            pg_basebackup_path: default_pg_basebackup_path(),
            pg_receivewal_path: default_pg_receivewal_path(),
        }
    }
}

/// How WAL is archived for a site.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    /// Only basebackups are taken.
    #[default]
    None,
    /// A long-running log streamer archives every WAL segment.
    #[serde(alias = "pg_receivexlog", alias = "pg_receivewal")]
    Streaming,
}

impl BackupMode {
    pub fn requires_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }
}

/// One candidate PostgreSQL endpoint of a site.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub user: String,
    /// Passed to tools through `PGPASSWORD`, never on the command line.
    pub password: Option<String>,
    pub dbname: Option<String>,
    /// Replication slot used by the log streamer.
    pub slot: Option<String>,
    pub sslmode: Option<String>,
}

fn default_pg_port() -> u16 {
    5432
}

impl NodeConfig {
    /// libpq connection string without the password.
    pub fn connection_string(&self) -> String {
        let mut parts = vec![
            format!("host={}", quote_conninfo(&self.host)),
            format!("port={}", self.port),
            format!("user={}", quote_conninfo(&self.user)),
        ];
        if let Some(dbname) = &self.dbname {
            parts.push(format!("dbname={}", quote_conninfo(dbname)));
        }
        if let Some(sslmode) = &self.sslmode {
            parts.push(format!("sslmode={}", quote_conninfo(sslmode)));
        }
        parts.join(" ")
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("dbname", &self.dbname)
            .field("slot", &self.slot)
            .field("sslmode", &self.sslmode)
            .finish()
    }
}

fn quote_conninfo(value: &str) -> String {
    if !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\')
    {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

/// One backed-up cluster.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteConfig {
    /// Candidate endpoints; one is picked at random per tick.
    pub nodes: Vec<NodeConfig>,
    /// Inactive sites are skipped entirely.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Hours between scheduled basebackups.
    #[serde(default = "default_basebackup_interval_hours")]
    pub basebackup_interval_hours: u64,
    /// Number of most recent basebackups to keep.
    #[serde(default = "default_basebackup_count")]
    pub basebackup_count: usize,
    #[serde(default)]
    pub active_backup_mode: BackupMode,
}

fn default_active() -> bool {
    true
}

fn default_basebackup_interval_hours() -> u64 {
    24
}

fn default_basebackup_count() -> usize {
    2
}

impl SiteConfig {
    /// Interval between scheduled basebackups.
    pub fn basebackup_interval(&self) -> time::Duration {
        // Saturate rather than wrap for absurd intervals
        let hours = i64::try_from(self.basebackup_interval_hours).unwrap_or(i64::MAX / 3600);
        time::Duration::hours(hours)
    }

    /// Validate one site's settings.
    pub fn validate(&self, site: &str) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err(format!("backup_sites.{site}.nodes cannot be empty"));
        }
        if self.basebackup_count == 0 {
            return Err(format!(
                "backup_sites.{site}.basebackup_count must be at least 1"
            ));
        }
        if self.basebackup_interval_hours == 0 {
            return Err(format!(
                "backup_sites.{site}.basebackup_interval_hours must be at least 1"
            ));
        }
        if site.is_empty() || site.contains('/') || site.contains("..") {
            return Err(format!("invalid site name: {site:?}"));
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// Local working directory for incoming and compressed files.
    pub backup_location: PathBuf,
    /// Prefix prepended to every remote key.
    #[serde(default)]
    pub path_prefix: String,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub compression: CompressionSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub tools: ToolPaths,
    /// Where the periodic JSON state snapshot is written.
    #[serde(default = "default_json_state_file_path")]
    pub json_state_file_path: PathBuf,
    /// Directory for alert marker files (defaults to `backup_location`).
    pub alert_file_dir: Option<PathBuf>,
    /// Sites keyed by name.
    #[serde(default)]
    pub backup_sites: BTreeMap<String, SiteConfig>,
}

fn default_json_state_file_path() -> PathBuf {
    PathBuf::from("/tmp/archivist_state.json")
}

impl AppConfig {
    /// Directory where alert files are created.
    pub fn alert_dir(&self) -> PathBuf {
        self.alert_file_dir
            .clone()
            .unwrap_or_else(|| self.backup_location.clone())
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.backup_location.as_os_str().is_empty() {
            return Err("backup_location cannot be empty".to_string());
        }
        self.storage.validate()?;
        self.orchestrator.validate()?;
        if self.compression.thread_count == 0 {
            return Err("compression.thread_count must be at least 1".to_string());
        }
        if self.transfer.thread_count == 0 {
            return Err("transfer.thread_count must be at least 1".to_string());
        }
        for (site, site_config) in &self.backup_sites {
            site_config.validate(site)?;
        }
        Ok(())
    }

    /// Create a test configuration rooted at `root`.
    ///
    /// **For testing only.** Uses filesystem storage under `root` and no sites.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            backup_location: root.join("local"),
            path_prefix: String::new(),
            storage: StorageConfig::Filesystem {
                path: root.join("remote"),
            },
            compression: CompressionSettings {
                algorithm: CompressionConfig::None,
                thread_count: 1,
            },
            transfer: TransferSettings { thread_count: 1 },
            orchestrator: OrchestratorConfig::default(),
            tools: ToolPaths::default(),
            json_state_file_path: root.join("state.json"),
            alert_file_dir: Some(root.join("alerts")),
            backup_sites: BTreeMap::new(),
        }
    }
}
