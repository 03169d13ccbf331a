//! PostgreSQL version checks and the cluster probe.

use crate::error::{SiteError, SiteResult};
use archivist_core::SegmentId;
use archivist_core::config::NodeConfig;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Connection, Row};
use std::path::Path;
use std::time::Duration;

/// Servers must be newer than this `server_version_num`.
pub const MIN_SERVER_VERSION: u32 = 90300;

/// First release using the `wal` naming for functions and tool flags.
pub const WAL_RENAME_VERSION: u32 = 100000;

/// First release supporting replication slots in `pg_receivewal`.
pub const SLOT_SUPPORT_VERSION: u32 = 90400;

/// Parse `--version` output such as `pg_basebackup (PostgreSQL) 9.5.3`.
///
/// Returns the number in `server_version_num` form: 9.5.3 is 90503 and
/// 16.2 is 160002.
pub fn parse_tool_version(output: &str) -> Option<u32> {
    let token = output.split_whitespace().find(|t| {
        t.chars().next().is_some_and(|c| c.is_ascii_digit())
    })?;
    let numeric: String = token
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.').filter(|p| !p.is_empty());
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next().map(str::parse::<u32>).transpose().ok()?.unwrap_or(0);
    let patch: u32 = parts.next().map(str::parse::<u32>).transpose().ok()?.unwrap_or(0);

    if major >= 10 {
        Some(major * 10000 + minor)
    } else {
        Some(major * 10000 + minor * 100 + patch)
    }
}

/// Reject servers that are too old or whose major version differs from the tool's.
pub fn check_versions(tool: &str, server: u32, client: u32) -> SiteResult<()> {
    if server <= MIN_SERVER_VERSION {
        return Err(SiteError::UnsupportedServerVersion(server));
    }
    if server / 100 != client / 100 {
        return Err(SiteError::VersionMismatch {
            tool: tool.to_string(),
            server,
            client,
        });
    }
    Ok(())
}

/// Run `<path> --version` and parse the result.
pub async fn tool_version(what: &'static str, path: &Path) -> SiteResult<u32> {
    let output = tokio::process::Command::new(path)
        .arg("--version")
        .output()
        .await
        .map_err(|e| SiteError::Launch {
            what,
            reason: format!("{}: {e}", path.display()),
        })?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_tool_version(&stdout).ok_or_else(|| SiteError::Launch {
        what,
        reason: format!("unrecognized version output {:?}", stdout.trim()),
    })
}

/// Queries a cluster node.
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    /// `server_version_num` of the node.
    async fn server_version(&self, node: &NodeConfig) -> SiteResult<u32>;

    /// Segment the node is currently writing.
    async fn current_wal_segment(
        &self,
        node: &NodeConfig,
        server_version: u32,
    ) -> SiteResult<SegmentId>;
}

/// Probe connecting with sqlx.
pub struct PgProbe {
    connect_timeout: Duration,
}

impl PgProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, node: &NodeConfig) -> SiteResult<PgConnection> {
        let mut options = PgConnectOptions::new()
            .host(&node.host)
            .port(node.port)
            .username(&node.user)
            .application_name("archivist");
        if let Some(password) = &node.password {
            options = options.password(password);
        }
        if let Some(dbname) = &node.dbname {
            options = options.database(dbname);
        }
        if let Some(mode) = &node.sslmode {
            let mode: PgSslMode = mode
                .parse()
                .map_err(|e| SiteError::Config(format!("invalid sslmode {mode:?}: {e}")))?;
            options = options.ssl_mode(mode);
        }

        match tokio::time::timeout(self.connect_timeout, options.connect()).await {
            Ok(result) => result.map_err(classify_connect_error),
            Err(_) => Err(SiteError::Connection(format!(
                "timed out connecting to {}:{}",
                node.host, node.port
            ))),
        }
    }
}

impl Default for PgProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl ClusterProbe for PgProbe {
    async fn server_version(&self, node: &NodeConfig) -> SiteResult<u32> {
        let mut conn = self.connect(node).await?;
        let row = sqlx::query("SHOW server_version_num")
            .fetch_one(&mut conn)
            .await
            .map_err(classify_query_error)?;
        let version: String = row.try_get(0).map_err(classify_query_error)?;
        let _ = conn.close().await;

        version
            .trim()
            .parse()
            .map_err(|_| SiteError::Unexpected(format!("bad server_version_num {version:?}")))
    }

    async fn current_wal_segment(
        &self,
        node: &NodeConfig,
        server_version: u32,
    ) -> SiteResult<SegmentId> {
        let sql = if server_version >= WAL_RENAME_VERSION {
            "SELECT pg_walfile_name(pg_current_wal_lsn())"
        } else {
            "SELECT pg_xlogfile_name(pg_current_xlog_location())"
        };

        let mut conn = self.connect(node).await?;
        let row = sqlx::query(sql)
            .fetch_one(&mut conn)
            .await
            .map_err(classify_query_error)?;
        let name: String = row.try_get(0).map_err(classify_query_error)?;
        let _ = conn.close().await;

        Ok(SegmentId::parse(name.trim())?)
    }
}

fn is_auth_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("28P01") | Some("28000"))
        }
        other => {
            let message = other.to_string();
            message.contains("password authentication failed")
                || message.contains("authentication failed")
        }
    }
}

fn classify_connect_error(err: sqlx::Error) -> SiteError {
    if is_auth_failure(&err) {
        SiteError::Authentication(err.to_string())
    } else {
        SiteError::Connection(err.to_string())
    }
}

fn classify_query_error(err: sqlx::Error) -> SiteError {
    if is_auth_failure(&err) {
        SiteError::Authentication(err.to_string())
    } else {
        SiteError::Unexpected(format!("query failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_versions() {
        assert_eq!(parse_tool_version("pg_basebackup (PostgreSQL) 9.5.3\n"), Some(90503));
        assert_eq!(parse_tool_version("pg_receivewal (PostgreSQL) 16.2"), Some(160002));
        assert_eq!(parse_tool_version("pg_receivewal (PostgreSQL) 10.1"), Some(100001));
        assert_eq!(
            parse_tool_version("pg_basebackup (PostgreSQL) 15.4 (Debian 15.4-1.pgdg120+1)"),
            Some(150004)
        );
        assert_eq!(parse_tool_version("pg_receivewal (PostgreSQL) 17beta1"), Some(170000));
        assert_eq!(parse_tool_version("no version here"), None);
    }

    #[test]
    fn rejects_old_servers() {
        assert!(matches!(
            check_versions("pg_basebackup", 90300, 90300),
            Err(SiteError::UnsupportedServerVersion(90300))
        ));
        assert!(check_versions("pg_basebackup", 90301, 90305).is_ok());
    }

    #[test]
    fn rejects_major_mismatch() {
        assert!(check_versions("pg_basebackup", 160002, 160004).is_ok());
        assert!(check_versions("pg_basebackup", 90503, 90501).is_ok());
        let err = check_versions("pg_basebackup", 150004, 160002).unwrap_err();
        assert!(matches!(err, SiteError::VersionMismatch { .. }));
        assert!(err.to_string().contains("pg_basebackup"));
    }
}
