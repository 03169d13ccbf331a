//! Alert marker files for external monitoring.

use std::path::{Path, PathBuf};
use tokio::fs;

/// Conditions operators are alerted about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Alert {
    /// The server is older than the oldest supported release.
    VersionUnsupported,
    /// Server and client tool major versions differ.
    VersionMismatch,
    /// The database rejected our credentials.
    Authentication,
    /// The database could not be reached or the site is misconfigured.
    Configuration,
}

impl Alert {
    /// Name of the marker file.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::VersionUnsupported => "version_unsupported_error",
            Self::VersionMismatch => "version_mismatch_error",
            Self::Authentication => "authentication_error",
            Self::Configuration => "configuration_error",
        }
    }
}

/// Creates alert files in a fixed directory.
#[derive(Clone, Debug)]
pub struct AlertSink {
    dir: PathBuf,
}

impl AlertSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the marker file for `alert`.
    ///
    /// Failures are logged; alerting never fails the caller.
    pub async fn raise(&self, alert: Alert) {
        let path = self.dir.join(alert.file_name());
        let result = async {
            fs::create_dir_all(&self.dir).await?;
            fs::write(&path, b"").await
        }
        .await;

        match result {
            Ok(()) => tracing::warn!(alert = alert.file_name(), path = %path.display(), "Alert raised"),
            Err(e) => tracing::error!(
                alert = alert.file_name(),
                path = %path.display(),
                error = %e,
                "Failed to create alert file"
            ),
        }
    }
}
