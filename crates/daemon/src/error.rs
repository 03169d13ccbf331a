//! Error types for a single site's tick.

use crate::alert::Alert;
use archivist_storage::StorageError;

/// Errors raised while handling one site.
///
/// The orchestrator catches these at the per-site boundary; none of them
/// terminates the control loop.
#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported PostgreSQL server version {0}")]
    UnsupportedServerVersion(u32),

    #[error("server version {server} does not match {tool} version {client}")]
    VersionMismatch {
        tool: String,
        server: u32,
        client: u32,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("failed to launch {what}: {reason}")]
    Launch { what: &'static str, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] archivist_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl SiteError {
    /// Short category used in logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::UnsupportedServerVersion(_) => "version_unsupported",
            Self::VersionMismatch { .. } => "version_mismatch",
            Self::Authentication(_) => "authentication",
            Self::Connection(_) => "connection",
            Self::Launch { .. } => "launch",
            Self::Storage(_) => "storage",
            Self::Core(_) => "core",
            Self::Io(_) => "io",
            Self::Unexpected(_) => "unexpected",
        }
    }

    /// Alert raised for this error, if operators should be notified.
    pub fn alert(&self) -> Option<Alert> {
        match self {
            Self::UnsupportedServerVersion(_) => Some(Alert::VersionUnsupported),
            Self::VersionMismatch { .. } => Some(Alert::VersionMismatch),
            Self::Authentication(_) => Some(Alert::Authentication),
            Self::Connection(_) | Self::Config(_) => Some(Alert::Configuration),
            _ => None,
        }
    }
}

/// Result type for site operations.
pub type SiteResult<T> = std::result::Result<T, SiteError>;
