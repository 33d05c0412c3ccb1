//! crewd - parallel agent attempt orchestrator.
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use crewd::{Daemon, DaemonConfig, DEFAULT_PORT};
use eyre::WrapErr;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "crewd", about = "Parallel agent attempt orchestrator", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "CREWD_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database path
    #[arg(long, env = "CREWD_DB")]
    db: Option<PathBuf>,

    /// Orchestrator config file (key=value)
    #[arg(short, long, env = "CREWD_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = DaemonConfig {
        port: cli.port,
        config_path: cli.config,
        ..DaemonConfig::default()
    };
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Arc::new(
            Daemon::new(config)
                .await
                .wrap_err("failed to initialize daemon")?,
        );

        let signals = Arc::clone(&daemon);
        tokio::spawn(async move {
            wait_for_signal().await;
            signals.shutdown();
        });

        daemon.run().await.wrap_err("daemon error")
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        tracing::error!("failed to register signal handlers");
        return std::future::pending().await;
    };

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received Ctrl-C, initiating graceful shutdown");
    }
}
