// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - Daemon
// Core service for managing SSH tunnels

mod bootstrap;
mod config;
mod dispatcher;
mod forward;
mod pidfile;
mod tunnel;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssh_tunnel_common::{ProfileStore, RusshConnector};

use config::DaemonConfig;
use dispatcher::{ControlServer, Dispatcher};
use tunnel::TunnelManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Set restrictive umask before creating any files
    bootstrap::set_restrictive_umask();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ssh_tunnel_daemon=info,ssh_tunnel_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("SSH Tunnel Manager Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // The launcher writes the secret first, so read it before anything can block
    let secret = Arc::new(bootstrap::read_unlock_secret().await?);

    let daemon_config = DaemonConfig::load()?;

    // Create PID file to prevent multiple instances
    let pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;
    debug!("PID file: {}", pid_guard.path().display());

    let profiles = Arc::new(ProfileStore::new(daemon_config.profiles_dir.clone()));
    info!("Profiles directory: {}", daemon_config.profiles_dir.display());

    let connector = Arc::new(RusshConnector::new(daemon_config.ssh_settings()));
    let tunnel_manager = TunnelManager::new(connector, daemon_config.tunnel_bind_ip()?);
    let dispatcher = Dispatcher::new(tunnel_manager.clone(), profiles, secret);

    let control_addr = daemon_config.control_addr()?;
    let listener = TcpListener::bind(control_addr)
        .await
        .with_context(|| format!("Failed to bind control listener on {}", control_addr))?;

    info!("Daemon listening on {}", control_addr);
    info!("Daemon started successfully");

    let server = ControlServer::spawn(listener, dispatcher, daemon_config.max_line_length);

    wait_for_shutdown().await;
    server.shutdown().await;

    tunnel_manager.stop_all().await;
    info!("All tunnels stopped");

    info!("Daemon shut down");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");

    #[cfg(unix)]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    };

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    };
}
