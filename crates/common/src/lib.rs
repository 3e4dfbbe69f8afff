// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - Common Library
// Shared types, control protocol, remote sessions, and profile storage

pub mod config;
pub mod daemon_client;
pub mod error;
pub mod network;
pub mod profile_manager;
pub mod protocol;
pub mod remote;
pub mod types;

pub use config::{ConnectionConfig, HostProfile, ProfileMetadata};
pub use daemon_client::{
    DaemonClientConfig, DaemonConnection, DaemonLauncher, DaemonSupervisor, ProcessLauncher,
};
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address, loopback_socket_addr};
pub use profile_manager::{profiles_dir, ProfileSource, ProfileStore};
pub use protocol::{Reply, Request, RequestFrame};
pub use remote::{
    BoxedStream, RemoteSession, RemoteTerminal, RusshConnector, SessionConnector, SessionError,
    SshSettings, TerminalRequest, TerminalResizer, WindowSize,
};
pub use types::{AuthType, TunnelSpec, UnlockSecret};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
