//! Resumable streamable-HTTP RPC server.
//!
//! Run with: cargo run -p resumable-rpc-server -- --config server.toml

mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use resumable_rpc_transport::{BasicHandler, StreamableHttpTransport};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "resumable-rpc-server", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "RESUMABLE_RPC_CONFIG")]
    config: Option<PathBuf>,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    let transport_config = config.transport_config()?;
    let path = transport_config.path.clone();
    let transport = StreamableHttpTransport::new(transport_config, Arc::new(BasicHandler::default()));
    let app = transport.router();

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Server listening on http://{addr}{path}");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    transport.close().await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
