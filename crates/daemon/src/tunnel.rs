// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - Tunnel Module
// Per-profile shared SSH sessions and the tunnels riding on them

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ssh_tunnel_common::{
    HostProfile, RemoteSession, SessionConnector, SessionError, TunnelSpec, UnlockSecret,
};

use crate::forward;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to connect profile {profile}: {source}")]
    Session {
        profile: String,
        #[source]
        source: SessionError,
    },

    #[error("Tunnel {0} is already active")]
    Conflict(TunnelSpec),

    #[error("Failed to listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Tunnel {0} was stopped while starting")]
    Cancelled(TunnelSpec),
}

/// The remote session of one profile, connected at most once
struct SharedRemote {
    session: OnceCell<Arc<dyn RemoteSession>>,
    closed: AtomicBool,
}

impl SharedRemote {
    fn new() -> Self {
        Self {
            session: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    async fn connect(
        &self,
        connector: &dyn SessionConnector,
        profile: &HostProfile,
        secret: &UnlockSecret,
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        let session = self
            .session
            .get_or_try_init(|| async {
                info!("Opening SSH session for profile {}", profile.name());
                connector.connect(profile, secret).await
            })
            .await?;
        Ok(session.clone())
    }

    /// Close the session if one was established. Idempotent.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(session) = self.session.get() {
            session.close().await;
        }
    }
}

struct ListenerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Listener task ended abnormally: {}", e);
        }
    }
}

struct TunnelEntry {
    id: u64,
    spec: TunnelSpec,
    /// `None` while the tunnel is starting
    listener: Option<ListenerHandle>,
}

impl TunnelEntry {
    fn is_active(&self) -> bool {
        self.listener.is_some()
    }
}

/// One remote session and the tunnels using it. Never kept without tunnels.
struct HostSession {
    remote: Arc<SharedRemote>,
    tunnels: Vec<TunnelEntry>,
}

impl HostSession {
    fn new() -> Self {
        Self {
            remote: Arc::new(SharedRemote::new()),
            tunnels: Vec::new(),
        }
    }

    fn active_specs(&self) -> Vec<TunnelSpec> {
        self.tunnels
            .iter()
            .filter(|t| t.is_active())
            .map(|t| t.spec.clone())
            .collect()
    }

    /// Close every listener, then the remote session. Returns the number of tunnels stopped.
    async fn shutdown(self) -> usize {
        let mut stopped = 0;
        for entry in self.tunnels {
            if let Some(listener) = entry.listener {
                listener.shutdown().await;
                stopped += 1;
            }
        }
        self.remote.close().await;
        stopped
    }
}

/// Owns every host session and tunnel of the daemon
#[derive(Clone)]
pub struct TunnelManager {
    sessions: Arc<Mutex<HashMap<String, HostSession>>>,
    connector: Arc<dyn SessionConnector>,
    bind_ip: IpAddr,
    next_id: Arc<AtomicU64>,
}

impl TunnelManager {
    pub fn new(connector: Arc<dyn SessionConnector>, bind_ip: IpAddr) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            connector,
            bind_ip,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start forwarding `spec` over the profile's shared session, connecting it first if needed
    pub async fn start_tunnel(
        &self,
        profile_name: &str,
        profile: &HostProfile,
        secret: &UnlockSecret,
        spec: TunnelSpec,
    ) -> Result<(), TunnelError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Duplicate check and placeholder insert happen under one lock
        let shared = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .entry(profile_name.to_string())
                .or_insert_with(HostSession::new);
            if session.tunnels.iter().any(|t| t.spec == spec) {
                return Err(TunnelError::Conflict(spec));
            }
            session.tunnels.push(TunnelEntry {
                id,
                spec: spec.clone(),
                listener: None,
            });
            session.remote.clone()
        };

        let remote = match shared.connect(self.connector.as_ref(), profile, secret).await {
            Ok(remote) => remote,
            Err(source) => {
                warn!("Session for {} failed: {}", profile_name, source);
                self.abandon(profile_name, id).await;
                return Err(TunnelError::Session {
                    profile: profile_name.to_string(),
                    source,
                });
            }
        };

        let bind_addr = SocketAddr::new(self.bind_ip, spec.source_port);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                warn!("Failed to bind {}: {}", bind_addr, source);
                self.abandon(profile_name, id).await;
                return Err(TunnelError::Listen {
                    port: spec.source_port,
                    source,
                });
            }
        };

        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(profile_name)
            .filter(|session| Arc::ptr_eq(&session.remote, &shared))
            .and_then(|session| session.tunnels.iter_mut().find(|t| t.id == id));

        let Some(entry) = entry else {
            // The session was torn down while we were connecting
            drop(sessions);
            drop(listener);
            remote.close().await;
            info!("Tunnel {} on {} cancelled during start", spec, profile_name);
            return Err(TunnelError::Cancelled(spec));
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward::accept_loop(
            listener,
            remote,
            spec.clone(),
            cancel.clone(),
        ));
        entry.listener = Some(ListenerHandle { cancel, task });

        info!("Tunnel started on {}: {} (listening on {})", profile_name, spec, bind_addr);
        Ok(())
    }

    /// Roll back a starting placeholder, releasing the session if it was the last entry
    async fn abandon(&self, profile_name: &str, id: u64) {
        let released = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(profile_name) else {
                return;
            };
            let before = session.tunnels.len();
            session.tunnels.retain(|t| t.id != id);
            if session.tunnels.len() == before || !session.tunnels.is_empty() {
                None
            } else {
                sessions.remove(profile_name).map(|session| session.remote)
            }
        };

        if let Some(remote) = released {
            remote.close().await;
            debug!("Released session for {} after failed start", profile_name);
        }
    }

    /// Stop one active tunnel. Returns `false` (a logged no-op) if there is nothing to stop.
    pub async fn stop_tunnel(&self, profile_name: &str, spec: &TunnelSpec) -> bool {
        let (listener, released) = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(profile_name) else {
                info!("No session for {}, nothing to stop", profile_name);
                return false;
            };
            let Some(pos) = session
                .tunnels
                .iter()
                .position(|t| t.is_active() && t.spec == *spec)
            else {
                info!("Tunnel {} is not active on {}, nothing to stop", spec, profile_name);
                return false;
            };

            let entry = session.tunnels.remove(pos);
            let released = if session.tunnels.is_empty() {
                sessions.remove(profile_name).map(|session| session.remote)
            } else {
                None
            };
            (entry.listener, released)
        };

        if let Some(listener) = listener {
            listener.shutdown().await;
        }
        info!("Tunnel stopped on {}: {}", profile_name, spec);

        if let Some(remote) = released {
            remote.close().await;
            info!("Last tunnel of {} stopped, session closed", profile_name);
        }
        true
    }

    /// Active tunnels of a profile in start order
    pub async fn list_tunnels(&self, profile_name: &str) -> Vec<TunnelSpec> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(profile_name)
            .map(HostSession::active_specs)
            .unwrap_or_default()
    }

    /// Active tunnels of every tracked profile
    pub async fn list_all_tunnels(&self) -> BTreeMap<String, Vec<TunnelSpec>> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .map(|(name, session)| (name.clone(), session.active_specs()))
            .collect()
    }

    /// Stop every tunnel of a profile and close its session
    pub async fn stop_all_for_profile(&self, profile_name: &str) -> usize {
        let session = self.sessions.lock().await.remove(profile_name);
        match session {
            Some(session) => {
                let stopped = session.shutdown().await;
                info!("Stopped {} tunnel(s) for {}", stopped, profile_name);
                stopped
            }
            None => {
                info!("No session for {}, nothing to stop", profile_name);
                0
            }
        }
    }

    /// Stop every tunnel and close every session (best-effort)
    pub async fn stop_all(&self) {
        let drained: Vec<(String, HostSession)> =
            self.sessions.lock().await.drain().collect();

        for (name, session) in drained {
            let stopped = session.shutdown().await;
            debug!("Stopped {} tunnel(s) for {}", stopped, name);
        }
    }
}
