// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - Forward Module
// Local listener accept loop and per-connection bridging over a remote session

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ssh_tunnel_common::{RemoteSession, TunnelSpec};

/// Accept connections until `cancel` fires, bridging each one to the tunnel's
/// destination. The listener is closed when this returns.
pub async fn accept_loop(
    listener: TcpListener,
    remote: Arc<dyn RemoteSession>,
    spec: TunnelSpec,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Listener for {} cancelled", spec);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {} on {}", peer, spec);
                    let remote = remote.clone();
                    let spec = spec.clone();
                    tokio::spawn(async move {
                        forward_connection(stream, peer, remote, &spec).await;
                    });
                }
                Err(e) => {
                    // Per-connection accept errors (e.g. aborted handshakes) leave the listener usable
                    warn!("Failed to accept connection on {}: {}", spec, e);
                }
            }
        }
    }
    info!("Stopped listening on port {}", spec.source_port);
}

/// Bridge one local connection to the remote destination until either side closes
async fn forward_connection(
    mut local: TcpStream,
    peer: SocketAddr,
    remote: Arc<dyn RemoteSession>,
    spec: &TunnelSpec,
) {
    let mut channel = match remote
        .open_forward(&spec.destination_host, spec.destination_port, peer)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            error!(
                "Failed to open forward to {}:{} for {}: {}",
                spec.destination_host, spec.destination_port, peer, e
            );
            return;
        }
    };

    match copy_bidirectional(&mut local, &mut channel).await {
        Ok((to_remote, to_local)) => debug!(
            "Forward connection {} closed: {} bytes out, {} bytes in",
            peer, to_remote, to_local
        ),
        Err(e) => debug!("Forward connection {} ended: {}", peer, e),
    }
}
