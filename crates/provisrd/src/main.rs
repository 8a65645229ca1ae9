//! Provisr Daemon - process supervisor and scheduler

use anyhow::Result;
use provisr_core::constants;
use provisr_cron::CronRegistry;
use provisr_events::SinkSet;
use provisr_manager::Manager;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "provisrd=info,provisr_manager=info,provisr_cron=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Provisr daemon starting...");

    // Ensure home directories exist
    let home = constants::provisr_home();
    if !home.exists() {
        std::fs::create_dir_all(&home)?;
        info!("Created Provisr home directory: {}", home.display());
    }
    std::fs::create_dir_all(constants::pidfiles_dir())?;
    std::fs::create_dir_all(constants::logs_dir())?;

    // Sinks stay empty here; the API layer wires real persistence and
    // metrics collaborators in.
    let sinks = SinkSet::new();
    let manager = Manager::new(sinks.clone());
    let cronjobs = CronRegistry::new(manager.clone(), sinks);

    // Set up signal handlers
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
    }

    // Scheduler first, so no new jobs spawn while processes stop
    cronjobs.shutdown(constants::DEFAULT_STOP_WAIT).await;
    manager.shutdown(Duration::from_secs(10)).await;

    info!("Daemon shutdown complete");
    Ok(())
}
