//! Heatwatch Binary Entry Point
//!
//! Runs the acquisition daemon. Core functionality is provided by the
//! `heatwatch` library crate.

use std::sync::Arc;

use clap::Parser;
use heatwatch::{AppConfig, ModbusDriverFactory, StorageBuilder, Supervisor};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Heatwatch - heat pump and energy meter acquisition daemon
#[derive(Parser, Debug)]
#[command(name = "heatwatch", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "HEATWATCH_CONFIG"
    )]
    config: String,

    /// Database URL (overrides config file)
    #[arg(long, env = "HEATWATCH_DB_URL")]
    db_url: Option<String>,

    /// Directory of additional device files (overrides config file)
    #[arg(long, env = "HEATWATCH_DEVICE_PATH")]
    device_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,heatwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Heatwatch - acquisition daemon");

    let cli = Cli::parse();

    // Load configuration (CLI > ENV > config file)
    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load_with_device_path(&cli.config, cli.device_path.as_deref())?;
    if let Some(url) = cli.db_url {
        config.database.url = url;
        config.validate()?;
    }

    let descriptors = config.device_descriptors();
    if descriptors.is_empty() {
        tracing::warn!("No enabled devices configured");
    }
    for d in &descriptors {
        tracing::info!(
            device = %d.id,
            class = %d.class,
            endpoint = %d.endpoint,
            interval = ?d.poll_interval,
            "Device configured"
        );
    }

    // Build storage layer
    let db_url = config.database.resolved_url();
    tracing::info!("Initializing storage at: {}", db_url);
    let handles = StorageBuilder::new(&db_url)
        .max_connections(config.database.max_connections)
        .build()
        .await?;
    tracing::info!("Storage initialized");

    // Start acquisition
    let factory = ModbusDriverFactory::new(
        config.polling.connect_timeout,
        config.polling.io_timeout,
    );
    let mut supervisor = Supervisor::new(
        descriptors,
        Arc::clone(&handles.store),
        Arc::new(factory),
        config.supervisor_settings(),
    )?;
    supervisor.start().await?;

    tracing::info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;

    tracing::info!("Stopping pollers and flushing...");
    match supervisor.stop().await {
        Ok(report) => tracing::info!(
            committed = report.committed,
            dropped = report.dropped,
            "Final flush complete"
        ),
        Err(e) => tracing::error!("Failed to stop supervisor: {}", e),
    }
    let stats = supervisor.writer_stats();
    tracing::info!(
        rows_committed = stats.rows_committed,
        rows_dropped = stats.rows_dropped,
        retries = stats.retries,
        "Writer statistics"
    );

    tracing::info!("Shutting down storage...");
    if let Err(e) = handles.shutdown().await {
        tracing::error!("Failed to shutdown storage: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
