//! Scalefeed Daemon - serial scale ingestion with a live feed
//!
//! Reads measurements from a serial-attached scale, persists meaningful
//! changes to SQLite and streams every reading to live subscribers over a
//! Unix socket. A second socket accepts control commands
//! (`status`, `latest`, `publish <record>`, `quit`).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scalefeed_broadcaster::LiveHub;
use scalefeed_daemon::{ControlContext, ControlServer, DaemonConfig, Pipeline};
use scalefeed_ingest::{LinkManager, SerialOpener};
use scalefeed_store::{MemoryRecordStore, RecordStore, SqliteRecordStore};

/// Scalefeed daemon
#[derive(Parser, Debug)]
#[command(name = "scalefeed-daemon")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep records in memory instead of the SQLite database
    #[arg(long)]
    in_memory: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!("⚖️ Starting Scalefeed Daemon v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DaemonConfig::load(cli.config).context("Failed to load configuration")?;
    config.apply_env_overrides();

    info!("📋 Configuration loaded from {}", config.config_path.display());

    let store: Arc<dyn RecordStore> = if cli.in_memory {
        warn!("Records are kept in memory and lost on exit");
        Arc::new(MemoryRecordStore::new())
    } else {
        let db_path = config.database_path()?;
        Arc::new(SqliteRecordStore::new(&db_path).context("Failed to open record database")?)
    };

    let hub = LiveHub::new(config.hub_config(), Some(Arc::clone(&store)));
    let live_socket = config.live_socket_path()?;
    hub.start(&live_socket)
        .await
        .context("Failed to start live hub")?;

    let pipeline = Pipeline::new(
        hub.clone(),
        Arc::clone(&store),
        config.gate_config(),
        config.source_label().map(str::to_string),
    )?;

    // Logs its own reason when ingestion is disabled or unconfigured
    let link = Arc::new(LinkManager::new(SerialOpener, config.link_config()));
    link.start(pipeline.sink())?;

    let shutdown = Arc::new(Notify::new());
    let control_socket = config.ipc_socket_path()?;
    let control = ControlServer::bind(
        &control_socket,
        ControlContext {
            pipeline: pipeline.clone(),
            link: link.clone(),
            shutdown: Arc::clone(&shutdown),
        },
    )
    .context("Failed to start control server")?;
    let control_task = tokio::spawn(control.run());

    info!("🚀 Scalefeed daemon ready!");
    info!("   Live feed: {}", live_socket.display());
    info!("   Control:   {}", control_socket.display());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("🛑 Received Ctrl-C"),
        _ = terminate_signal() => info!("🛑 Received SIGTERM"),
        _ = shutdown.notified() => info!("🛑 Received quit command"),
    }

    info!("🧹 Shutting down...");
    link.stop().await;
    if let Err(e) = hub.stop().await {
        warn!("Failed to stop live hub: {}", e);
    }
    control_task.abort();
    if let Err(e) = std::fs::remove_file(&control_socket) {
        warn!("Failed to remove control socket: {}", e);
    }

    info!("👋 Scalefeed daemon stopped");
    Ok(())
}

/// Initialize the tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_level(true))
        .with(filter)
        .init();

    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
