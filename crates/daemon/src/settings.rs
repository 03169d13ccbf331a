//! Loading configuration from disk and the environment.

use crate::alert::{Alert, AlertSink};
use crate::orchestrator::OrchestratorHandle;
use anyhow::{Context, Result};
use archivist_core::config::AppConfig;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::Path;

/// Merge the config file (if present) with `ARCHIVIST_` environment variables.
///
/// The result is not validated.
pub fn read_config(config_path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %config_path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(config_path));
    } else {
        tracing::debug!("No config file found at {}", config_path.display());
    }

    let has_env_config = std::env::vars()
        .any(|(key, _)| key.starts_with("ARCHIVIST_") && key != "ARCHIVIST_CONFIG");
    if !config_path.exists() && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: archivistd --config /path/to/archivist.toml\n  \
             2. Environment variables: ARCHIVIST_BACKUP_LOCATION=/var/lib/archivist ...\n\n\
             Set ARCHIVIST_CONFIG to change the default config file path."
        );
    }

    figment
        .merge(Env::prefixed("ARCHIVIST_").split("__"))
        .extract()
        .context("failed to load configuration")
}

/// Read and validate the startup configuration.
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    let config = read_config(config_path)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

/// Re-read the configuration and hand it to the orchestrator.
///
/// A file that cannot be parsed raises `configuration_error` here; one that
/// parses but fails validation is rejected, and alerted, by the orchestrator.
/// Returns false once the orchestrator is gone.
pub async fn reload_from_file(
    config_path: &Path,
    handle: &OrchestratorHandle,
    alerts: &AlertSink,
) -> bool {
    match read_config(config_path) {
        Ok(config) => handle.reload(config),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Keeping previous configuration");
            alerts.raise(Alert::Configuration).await;
            true
        }
    }
}
