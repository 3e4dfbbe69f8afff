// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - Remote Session Module
// Authenticated remote sessions, abstracted over the SSH implementation

pub mod known_hosts;
pub mod ssh;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::config::HostProfile;
use crate::types::UnlockSecret;

pub use ssh::{RusshConnector, SshSettings};

/// Byte stream carried over a remote session
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardStream for T {}

pub type BoxedStream = Box<dyn ForwardStream>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to connect to {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("Connection to {addr} timed out after {secs}s")]
    Timeout { addr: String, secs: u64 },

    #[error("Host key for {0} was rejected")]
    HostKeyRejected(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Failed to load key {path}: {message}")]
    Key { path: String, message: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Session is closed")]
    Closed,
}

/// Terminal parameters for an interactive shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for TerminalRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Terminal size in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
}

/// Reports local window size changes to a remote pseudo-terminal
#[derive(Debug, Clone)]
pub struct TerminalResizer {
    sizes: mpsc::UnboundedSender<WindowSize>,
}

impl TerminalResizer {
    /// A resizer and the receiving end the terminal's owner drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WindowSize>) {
        let (sizes, rx) = mpsc::unbounded_channel();
        (Self { sizes }, rx)
    }

    /// Queue a window change. `false` once the terminal is gone.
    pub fn resize(&self, size: WindowSize) -> bool {
        self.sizes.send(size).is_ok()
    }
}

/// An interactive shell on the remote host
pub struct RemoteTerminal {
    pub stream: BoxedStream,
    pub resizer: TerminalResizer,
}

/// An authenticated session to one remote host.
///
/// Many forwarded connections may be opened over one session concurrently.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Open a channel to `host:port` as seen from the remote side
    async fn open_forward(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, SessionError>;

    /// Open an interactive shell with a pseudo-terminal
    async fn open_terminal(
        &self,
        request: &TerminalRequest,
    ) -> Result<RemoteTerminal, SessionError>;

    /// Close the session. Calling it more than once is harmless.
    async fn close(&self);
}

/// Establishes authenticated sessions from profiles
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        profile: &HostProfile,
        secret: &UnlockSecret,
    ) -> Result<Arc<dyn RemoteSession>, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resizer_reports_closed_terminal() {
        let (resizer, mut sizes) = TerminalResizer::channel();
        let size = WindowSize { cols: 120, rows: 40 };

        assert!(resizer.resize(size));
        assert_eq!(sizes.try_recv().unwrap(), size);

        drop(sizes);
        assert!(!resizer.resize(size));
    }
}
