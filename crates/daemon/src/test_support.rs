// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// Fakes for the remote session seam, shared by the daemon's unit tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use ssh_tunnel_common::remote::{BoxedStream, RemoteTerminal, SessionError, TerminalRequest};
use ssh_tunnel_common::{
    AuthType, ConnectionConfig, HostProfile, RemoteSession, SessionConnector, UnlockSecret,
};

/// Remote end of a forward opened through a fake session
pub type OpenedForward = (String, u16, DuplexStream);

pub struct FakeSession {
    closes: Arc<AtomicUsize>,
    forwards: mpsc::UnboundedSender<OpenedForward>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn open_forward(
        &self,
        host: &str,
        port: u16,
        _originator: SocketAddr,
    ) -> Result<BoxedStream, SessionError> {
        let (near, far) = tokio::io::duplex(4096);
        self.forwards
            .send((host.to_string(), port, far))
            .map_err(|_| SessionError::Closed)?;
        Ok(Box::new(near))
    }

    async fn open_terminal(
        &self,
        _request: &TerminalRequest,
    ) -> Result<RemoteTerminal, SessionError> {
        Err(SessionError::Channel("no terminal in tests".to_string()))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts connects and session closes
pub struct FakeConnector {
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    delay: Duration,
    failure: Option<String>,
    forwards: mpsc::UnboundedSender<OpenedForward>,
}

impl FakeConnector {
    fn build(
        delay: Duration,
        failure: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OpenedForward>) {
        let (forwards, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            delay,
            failure,
            forwards,
        });
        (connector, rx)
    }

    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OpenedForward>) {
        Self::build(Duration::ZERO, None)
    }

    pub fn with_delay(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<OpenedForward>) {
        Self::build(delay, None)
    }

    pub fn failing(message: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<OpenedForward>) {
        Self::build(Duration::ZERO, Some(message.to_string()))
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        profile: &HostProfile,
        _secret: &UnlockSecret,
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(SessionError::Connect {
                addr: ssh_tunnel_common::format_host_port(
                    &profile.connection.host,
                    profile.connection.port,
                ),
                message: message.clone(),
            });
        }
        Ok(Arc::new(FakeSession {
            closes: self.closes.clone(),
            forwards: self.forwards.clone(),
        }))
    }
}

pub fn test_profile(name: &str) -> HostProfile {
    HostProfile::new(
        name,
        ConnectionConfig {
            host: format!("{}.example.com", name),
            port: 22,
            user: "deploy".to_string(),
            auth_type: AuthType::Password,
            key_path: None,
            password: Some("hunter2".to_string()),
        },
    )
}

/// A loopback port that was free a moment ago
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}
