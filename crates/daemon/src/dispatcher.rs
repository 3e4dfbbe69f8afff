// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - Dispatcher Module
// Control listener: routes framed requests to the tunnel manager and always answers

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ssh_tunnel_common::protocol::{
    control_codec, correlation_id_of, encode_frame, parse_frame, Reply, Request, RequestFrame,
};
use ssh_tunnel_common::{HostProfile, ProfileSource, UnlockSecret};

use crate::tunnel::{TunnelError, TunnelManager};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{0}")]
    Validation(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Profile {0} not found")]
    ProfileNotFound(String),

    #[error("Failed to load profile: {0}")]
    Storage(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl From<ssh_tunnel_common::Error> for DispatchError {
    fn from(e: ssh_tunnel_common::Error) -> Self {
        use ssh_tunnel_common::Error;
        match e {
            Error::Validation(message) => DispatchError::Validation(message),
            Error::UnknownAction(action) => DispatchError::UnknownAction(action),
            Error::ProfileNotFound(name) => DispatchError::ProfileNotFound(name),
            other => DispatchError::Storage(other.to_string()),
        }
    }
}

/// Turns control requests into tunnel manager calls
#[derive(Clone)]
pub struct Dispatcher {
    tunnels: TunnelManager,
    profiles: Arc<dyn ProfileSource>,
    secret: Arc<UnlockSecret>,
}

impl Dispatcher {
    pub fn new(
        tunnels: TunnelManager,
        profiles: Arc<dyn ProfileSource>,
        secret: Arc<UnlockSecret>,
    ) -> Self {
        Self {
            tunnels,
            profiles,
            secret,
        }
    }

    /// Handle one control line. `None` means the line was dropped as malformed.
    pub async fn handle_line(&self, line: &str) -> Option<Reply> {
        let value = parse_frame(line)?;
        let correlation_id = correlation_id_of(&value);

        let reply = match serde_json::from_value::<RequestFrame>(value) {
            Ok(frame) => self.dispatch(frame).await,
            Err(e) => {
                debug!("Undecodable request: {}", e);
                Reply::failure(format!("Invalid request: {}", e)).with_correlation_id(correlation_id)
            }
        };
        Some(reply)
    }

    /// Produce exactly one reply for a request, echoing its correlation id
    pub async fn dispatch(&self, frame: RequestFrame) -> Reply {
        let correlation_id = frame.correlation_id.clone();
        let action = frame.action.clone().unwrap_or_default();

        let reply = match AssertUnwindSafe(self.execute(frame)).catch_unwind().await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!("Request {} failed: {}", action, e);
                Reply::failure(e.to_string())
            }
            Err(_) => {
                error!("Request {} panicked", action);
                Reply::failure("Internal error")
            }
        };
        reply.with_correlation_id(correlation_id)
    }

    async fn execute(&self, frame: RequestFrame) -> Result<Reply, DispatchError> {
        match frame.into_request()? {
            Request::StartTunnel {
                profile_name,
                tunnel,
            } => {
                let profile = self.profile(&profile_name)?;
                self.tunnels
                    .start_tunnel(&profile_name, &profile, &self.secret, tunnel)
                    .await?;
                Ok(Reply::ok())
            }
            Request::StopTunnel {
                profile_name,
                tunnel,
            } => {
                self.tunnels.stop_tunnel(&profile_name, &tunnel).await;
                Ok(Reply::ok())
            }
            Request::ListTunnels { profile_name } => {
                Ok(Reply::ok().with_tunnels(self.tunnels.list_tunnels(&profile_name).await))
            }
            Request::ListAllTunnels => {
                Ok(Reply::ok().with_profiles(self.tunnels.list_all_tunnels().await))
            }
            Request::StopProfile { profile_name } => {
                self.tunnels.stop_all_for_profile(&profile_name).await;
                Ok(Reply::ok())
            }
        }
    }

    fn profile(&self, name: &str) -> Result<HostProfile, DispatchError> {
        self.profiles
            .lookup(name)?
            .ok_or_else(|| DispatchError::ProfileNotFound(name.to_string()))
    }
}

/// The spawned control listener
pub struct ControlServer {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ControlServer {
    pub fn spawn(listener: TcpListener, dispatcher: Dispatcher, max_line_length: usize) -> Self {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            dispatcher,
            max_line_length,
            shutdown.clone(),
        ));
        Self { shutdown, task }
    }

    /// Stop accepting and wait for the listener task. `false` if it panicked or was aborted.
    pub async fn shutdown(self) -> bool {
        self.shutdown.cancel();
        match self.task.await {
            Ok(()) => true,
            Err(e) => {
                warn!("Control server task ended abnormally: {}", e);
                false
            }
        }
    }
}

/// Accept control connections until `shutdown` fires
async fn serve(
    listener: TcpListener,
    dispatcher: Dispatcher,
    max_line_length: usize,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Control listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if !peer.ip().is_loopback() {
                        warn!("Rejected control connection from non-loopback peer {}", peer);
                        continue;
                    }
                    debug!("Control connection from {}", peer);
                    let dispatcher = dispatcher.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, dispatcher, max_line_length, shutdown).await;
                        debug!("Control connection from {} closed", peer);
                    });
                }
                Err(e) => error!("Failed to accept control connection: {}", e),
            }
        }
    }
}

/// Each request runs as its own task so a slow `startTunnel` never holds up
/// other requests on the connection; replies are written in completion order.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    max_line_length: usize,
    shutdown: CancellationToken,
) {
    let (mut writer, mut lines) = Framed::new(stream, control_codec(max_line_length)).split();
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<Reply>();
    // Dropped once the peer stops sending; the loop ends when in-flight replies are written
    let mut reply_tx = Some(reply_tx);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next(), if reply_tx.is_some() => match next {
                Some(Ok(line)) => {
                    let Some(reply_tx) = reply_tx.clone() else {
                        continue;
                    };
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        match dispatcher.handle_line(&line).await {
                            Some(reply) => {
                                let _ = reply_tx.send(reply);
                            }
                            None => debug!("Dropped malformed control line from {}", peer),
                        }
                    });
                }
                Some(Err(e)) => {
                    debug!("Control connection {} failed: {}", peer, e);
                    reply_tx = None;
                }
                None => reply_tx = None,
            },
            reply = replies.recv() => {
                let Some(reply) = reply else {
                    break;
                };
                let encoded = match encode_frame(&reply) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        error!("Failed to encode reply: {}", e);
                        continue;
                    }
                };
                if let Err(e) = writer.send(encoded).await {
                    debug!("Failed to send reply to {}: {}", peer, e);
                    break;
                }
            }
        }
    }
}
