//! Grid Streamer Daemon
//!
//! Serves simulation grid results to browsers over WebSocket. Each client
//! sends `{"event":"simulation_id","data":"<id>"}` and receives that
//! simulation's hourly records as `gridData` events, followed by
//! `{"simulation_ended": true}` once the results are complete.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:3000)
//! grid-streamer-daemon
//!
//! # Custom address and data directory
//! grid-streamer-daemon --bind 0.0.0.0:3000 --data-dir /srv/simulations
//!
//! # With config file
//! grid-streamer-daemon --config /etc/grid-streamer/streamer.toml
//!
//! # Verbose logging
//! RUST_LOG=debug grid-streamer-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use grid_streamer_core::config::{default_config_path, load_config_from_path};
use grid_streamer_core::{ConfigOverrides, FsResultStore};
use server::{ServerConfig, StreamerServer};

/// Grid Streamer Daemon - streams hourly simulation results to WebSocket clients
#[derive(Parser, Debug)]
#[command(name = "grid-streamer-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "GRID_STREAMER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config and environment)
    #[arg(short = 'b', long, value_name = "ADDR")]
    bind: Option<String>,

    /// Simulation data directory (overrides config and environment)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(long, value_name = "N")]
    max_connections: Option<usize>,

    /// End streams when the run reports `failed`
    #[arg(long)]
    end_on_failed_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "GRID_STREAMER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind_address: self.bind.clone(),
            data_dir: self.data_dir.clone(),
            max_connections: self.max_connections,
            end_on_failed_run: self.end_on_failed_run.then_some(true),
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "grid_streamer_daemon={level},grid_streamer_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Grid streamer daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    config
        .apply_overrides(&args.overrides())
        .context("Invalid command-line option")?;

    let store = Arc::new(FsResultStore::new(config.data_dir.clone()));
    info!(
        bind = %config.bind_address,
        data_dir = %store.root().display(),
        source = %config.source(),
        "Configuration loaded"
    );
    if !store.root().is_dir() {
        warn!(path = %store.root().display(), "Data directory does not exist yet, every simulation will be unknown");
    }

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let server = StreamerServer::new(ServerConfig::from(&config), store);

    match server.run(shutdown).await {
        Ok(()) => {
            info!("Grid streamer daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
