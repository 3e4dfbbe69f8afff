// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - SSH Session Module
// russh-backed implementation of the remote session capability

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::known_hosts::{fingerprint, HostKeyStatus, KnownHosts};
use super::{
    BoxedStream, RemoteSession, RemoteTerminal, SessionConnector, SessionError, TerminalRequest,
    TerminalResizer, WindowSize,
};
use crate::config::HostProfile;
use crate::types::{AuthType, UnlockSecret};

const TERMINAL_BUFFER: usize = 8 * 1024;

/// Connection settings shared by every session a connector opens
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub known_hosts_path: PathBuf,
    /// Record unknown host keys on first use instead of refusing them
    pub accept_new_host_keys: bool,
}

/// Opens russh sessions
#[derive(Debug, Clone)]
pub struct RusshConnector {
    settings: SshSettings,
}

impl RusshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn client_config(&self) -> Arc<Config> {
        let mut cfg = Config::default();
        // disable nagle for lower latency
        cfg.nodelay = true;
        cfg.keepalive_interval = Some(self.settings.keepalive_interval);
        cfg.keepalive_max = 3;
        Arc::new(cfg)
    }

    /// Connect and authenticate against the profile's host
    pub async fn open(
        &self,
        profile: &HostProfile,
        secret: &UnlockSecret,
    ) -> Result<RusshSession, SessionError> {
        let conn = &profile.connection;
        let addr = crate::format_host_port(&conn.host, conn.port);

        let handler = ClientHandler {
            host: conn.host.clone(),
            port: conn.port,
            known_hosts_path: self.settings.known_hosts_path.clone(),
            accept_new: self.settings.accept_new_host_keys,
        };

        info!("Connecting to SSH server: {}", addr);
        let mut handle = match tokio::time::timeout(
            self.settings.connect_timeout,
            client::connect(self.client_config(), addr.as_str(), handler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(russh::Error::UnknownKey)) => return Err(SessionError::HostKeyRejected(addr)),
            Ok(Err(e)) => {
                return Err(SessionError::Connect {
                    addr,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(SessionError::Timeout {
                    addr,
                    secs: self.settings.connect_timeout.as_secs(),
                })
            }
        };

        if let Err(e) = authenticate(&mut handle, profile, secret).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
            return Err(e);
        }

        info!("SSH session established: {}", profile.target());
        Ok(RusshSession {
            handle,
            target: profile.target(),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SessionConnector for RusshConnector {
    async fn connect(
        &self,
        profile: &HostProfile,
        secret: &UnlockSecret,
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        let session = self.open(profile, secret).await?;
        Ok(Arc::new(session))
    }
}

/// russh client handler doing known_hosts verification
struct ClientHandler {
    host: String,
    port: u16,
    known_hosts_path: PathBuf,
    accept_new: bool,
}

fn io_error(message: String) -> russh::Error {
    russh::Error::from(std::io::Error::other(message))
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let mut known_hosts = KnownHosts::open(&self.known_hosts_path)
            .map_err(|e| io_error(format!("Failed to load known_hosts: {}", e)))?;
        let (host, port) = (self.host.as_str(), self.port);

        match known_hosts.check(host, port, server_public_key) {
            HostKeyStatus::Trusted => {
                debug!("Host key verified for {}:{}", host, port);
                Ok(true)
            }
            HostKeyStatus::Unknown if self.accept_new => {
                known_hosts.remember(host, port, server_public_key);
                known_hosts
                    .save()
                    .map_err(|e| io_error(format!("Failed to save known_hosts: {}", e)))?;
                warn!(
                    "Permanently added host key for {}:{} ({} {})",
                    host,
                    port,
                    server_public_key.algorithm().as_str(),
                    fingerprint(server_public_key)
                );
                Ok(true)
            }
            HostKeyStatus::Unknown => {
                error!(
                    "Host key for {}:{} is not in {} and new keys are not accepted ({})",
                    host,
                    port,
                    known_hosts.path().display(),
                    fingerprint(server_public_key)
                );
                Ok(false)
            }
            HostKeyStatus::Changed { line } => {
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!("@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @");
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!("Host: {}:{}", host, port);
                error!("Presented fingerprint: {}", fingerprint(server_public_key));
                error!(
                    "Remove line {} from {} if the change is expected.",
                    line,
                    known_hosts.path().display()
                );
                Ok(false)
            }
        }
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    profile: &HostProfile,
    secret: &UnlockSecret,
) -> Result<(), SessionError> {
    let conn = &profile.connection;
    let auth_error = |e: russh::Error| SessionError::Auth(e.to_string());

    let result = match conn.auth_type {
        AuthType::Key => {
            let key_path = conn
                .key_path
                .as_deref()
                .ok_or_else(|| SessionError::Auth("No key path configured".to_string()))?;
            let key = load_key(key_path, secret)?;

            // RSA keys need the hash negotiated; other key types ignore it
            let hash = handle
                .best_supported_rsa_hash()
                .await
                .map_err(auth_error)?
                .flatten();
            handle
                .authenticate_publickey(&conn.user, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
                .await
                .map_err(auth_error)?
        }
        AuthType::Password => {
            let password: Zeroizing<String> = match &conn.password {
                Some(password) => Zeroizing::new(password.clone()),
                None => secret.clone(),
            };
            handle
                .authenticate_password(&conn.user, password.as_str())
                .await
                .map_err(auth_error)?
        }
    };

    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods, ..
        } => {
            let methods: Vec<String> = remaining_methods
                .iter()
                .map(|m| {
                    let s: &str = m.into();
                    s.to_string()
                })
                .collect();
            let detail = if methods.is_empty() {
                "no methods left".to_string()
            } else {
                format!("server requires: {}", methods.join(", "))
            };
            Err(SessionError::Auth(format!(
                "{} rejected for {} ({})",
                auth_label(&conn.auth_type),
                profile.target(),
                detail
            )))
        }
    }
}

fn auth_label(auth_type: &AuthType) -> &'static str {
    match auth_type {
        AuthType::Key => "Public key",
        AuthType::Password => "Password",
    }
}

/// Load a private key, retrying with the unlock secret as passphrase when it is encrypted
fn load_key(key_path: &Path, secret: &UnlockSecret) -> Result<PrivateKey, SessionError> {
    let expanded = shellexpand::tilde(&key_path.to_string_lossy()).into_owned();
    let key_error = |e: russh::keys::Error| SessionError::Key {
        path: expanded.clone(),
        message: e.to_string(),
    };

    match load_secret_key(&expanded, None) {
        Ok(key) => Ok(key),
        Err(e) => {
            let text = e.to_string().to_lowercase();
            if text.contains("encrypted") || text.contains("passphrase") || text.contains("decrypt")
            {
                debug!("Key {} is encrypted, using the unlock secret", expanded);
                load_secret_key(&expanded, Some(secret.as_str())).map_err(key_error)
            } else {
                Err(key_error(e))
            }
        }
    }
}

/// An authenticated russh session
pub struct RusshSession {
    handle: Handle<ClientHandler>,
    target: String,
    closed: AtomicBool,
}

impl RusshSession {
    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn open_forward(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }

        let channel = self
            .handle
            .channel_open_direct_tcpip(
                host,
                port.into(),
                originator.ip().to_string(),
                originator.port().into(),
            )
            .await
            .map_err(|e| SessionError::Channel(e.to_string()))?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn open_terminal(
        &self,
        request: &TerminalRequest,
    ) -> Result<RemoteTerminal, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let channel_error = |e: russh::Error| SessionError::Channel(e.to_string());

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(channel_error)?;
        channel
            .request_pty(false, &request.term, request.cols, request.rows, 0, 0, &[])
            .await
            .map_err(channel_error)?;
        channel.request_shell(false).await.map_err(channel_error)?;

        // The channel stays with the pump so window changes can still reach it
        let (local, remote) = tokio::io::duplex(TERMINAL_BUFFER);
        let (resizer, sizes) = TerminalResizer::channel();
        tokio::spawn(pump_terminal(channel, remote, sizes));

        Ok(RemoteTerminal {
            stream: Box::new(local),
            resizer,
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Disconnect from {} failed: {}", self.target, e);
        }
        info!("SSH session closed: {}", self.target);
    }
}

/// Move bytes between a shell channel and the local end of its duplex, and
/// apply window changes, until the remote side closes or the local end is dropped
async fn pump_terminal(
    mut channel: Channel<client::Msg>,
    local: DuplexStream,
    mut sizes: mpsc::UnboundedReceiver<WindowSize>,
) {
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let mut buf = vec![0u8; TERMINAL_BUFFER];
    let mut input_open = true;

    loop {
        tokio::select! {
            read = local_read.read(&mut buf), if input_open => match read {
                Ok(0) | Err(_) => {
                    input_open = false;
                    let _ = channel.eof().await;
                }
                Ok(n) => {
                    if let Err(e) = channel.data(&buf[..n]).await {
                        debug!("Terminal write failed: {}", e);
                        break;
                    }
                }
            },
            Some(size) = sizes.recv() => {
                if let Err(e) = channel.window_change(size.cols, size.rows, 0, 0).await {
                    debug!("Window change failed: {}", e);
                }
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if local_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Remote shell exited with status {}", exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    let _ = local_write.shutdown().await;
    let _ = channel.close().await;
}
