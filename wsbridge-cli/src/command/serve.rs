//! Serve command - runs the WebSocket-to-TCP bridge server.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use wsbridge::{BridgeConfig, BridgeServer, ServerConfig};

use crate::config::Config;

/// Run the bridge server
#[derive(Debug, Parser)]
pub struct Args {
    /// Listen address
    #[arg(long, env = "WSBRIDGE_LISTEN")]
    listen: Option<IpAddr>,

    /// Listen port
    #[arg(short, long, env = "WSBRIDGE_PORT")]
    port: Option<u16>,

    /// Allow bridging to loopback and private network targets
    #[arg(long)]
    allow_local_targets: bool,
}

pub async fn execute(args: &Args, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;

    let addr = SocketAddr::new(
        args.listen.unwrap_or(config.listen.addr),
        args.port.unwrap_or(config.listen.port),
    );

    let server_config = ServerConfig {
        allowed_origins: config.bridge.allowed_origins.clone(),
        deny_local_targets: config.bridge.deny_local_targets && !args.allow_local_targets,
        bridge: BridgeConfig {
            connect_timeout: Duration::from_secs(config.bridge.connect_timeout_secs.max(1)),
            ping_interval: Duration::from_secs(config.bridge.ping_interval_secs.max(1)),
        },
    };

    let server = BridgeServer::bind(addr, server_config)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    server
        .serve_until(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        // SIGTERM matters for containerized deployments.
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("received shutdown signal");
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
    }
}
