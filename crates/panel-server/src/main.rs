//! panel-server: game-server panel daemon.
//!
//! Launches the configured game-server processes, records their console
//! output, and serves authenticated, resumable console streams over
//! WebSocket.

mod auth;
mod config;
mod console;
mod gateway;
mod http;
mod process;
mod server;

use clap::Parser;
use config::{Overrides, ServerConfig};
use server::PanelServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// panel-server: game-server panel daemon
#[derive(Parser, Debug)]
#[command(name = "panel-server", version, about = "Game-server panel daemon")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.panel/server.toml")]
    config: String,

    /// Console lines retained per process
    #[arg(long)]
    buffer_capacity: Option<usize>,

    /// Session time-to-live in seconds
    #[arg(long)]
    session_ttl: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting panel-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        Overrides {
            bind: cli.bind,
            port: cli.port,
            buffer_capacity: cli.buffer_capacity,
            session_ttl: cli.session_ttl,
        },
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let panel = match PanelServer::new(server_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    if let Err(e) = panel.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("panel-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
