//! Archivist daemon binary.

use anyhow::{Context, Result};
use archivist_daemon::alert::AlertSink;
use archivist_daemon::settings::{load_config, reload_from_file};
use archivist_daemon::{Collaborators, Orchestrator, OrchestratorHandle};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Archivist - continuous PostgreSQL backups
#[derive(Parser, Debug)]
#[command(name = "archivistd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "ARCHIVIST_CONFIG",
        default_value = "config/archivist.toml"
    )]
    config: PathBuf,
}

/// Translate process signals into orchestrator requests.
async fn handle_signals(
    config_path: PathBuf,
    handle: OrchestratorHandle,
    alerts: AlertSink,
) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, shutting down");
                break;
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
                break;
            }
            _ = hangup.recv() => {
                tracing::info!("Received SIGHUP, reloading configuration");
                if !reload_from_file(&config_path, &handle, &alerts).await {
                    break;
                }
            }
        }
    }

    handle.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Archivist v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    let storage = archivist_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend ready");

    let alerts = AlertSink::new(config.alert_dir());
    let collaborators = Collaborators::postgres(&config, storage);
    let (orchestrator, handle) = Orchestrator::new(config, collaborators);

    let signals = tokio::spawn(handle_signals(args.config.clone(), handle.clone(), alerts));

    orchestrator
        .run()
        .await
        .context("orchestrator failed to start")?;
    signals.abort();

    tracing::info!("Archivist stopped");
    Ok(())
}
