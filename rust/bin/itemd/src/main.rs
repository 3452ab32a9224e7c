//! `itemd`: the item store server binary.
//!
//! Usage:
//!   itemd [-c <config.toml>] [--listen <addr>] [--data-dir <dir>] [--db <path>]
//!         [--drain-timeout-secs <n>]
//!
//! Flags override values from the config file. SIGINT or SIGTERM starts a
//! graceful shutdown bounded by the drain timeout.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use itemd::Server;
use itemd_core::ServiceConfig;

/// Item store server.
#[derive(Parser, Debug)]
#[command(name = "itemd", about = "Persistent key-value store over HTTP")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Listen address (default 0.0.0.0:8080).
    #[arg(long = "listen")]
    listen: Option<String>,

    /// Data directory (default ./data).
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// Database file (default {data-dir}/data.redb).
    #[arg(long = "db")]
    db: Option<PathBuf>,

    /// Seconds to wait for in-flight requests on shutdown (default 2).
    #[arg(long = "drain-timeout-secs")]
    drain_timeout_secs: Option<u64>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                ServiceConfig::load(path)?
            }
            None => ServiceConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(db) = self.db {
            config.db_path = Some(db);
        }
        if let Some(secs) = self.drain_timeout_secs {
            config.drain_timeout_secs = secs;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Cli::parse().into_config()?;
    let deadline = config.drain_timeout();

    let mut server = Server::new(config);
    let addr = server.start().await.context("failed to start server")?;
    info!("itemd listening on {}", addr);

    shutdown_signal().await;
    info!("Shutdown signal received");

    match server.shutdown(deadline).await {
        Ok(report) if report.drained => info!("Server exiting"),
        Ok(_) => warn!("Server exiting, drain timed out after {:?}", deadline),
        Err(e) => {
            error!(error = %e, "Server shutdown failed");
            return Err(e).context("server shutdown failed");
        }
    }

    Ok(())
}

/// Resolve on ctrl-c, or on SIGTERM where available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
