// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - CLI Shell Module
// Interactive remote terminal, opened directly rather than through the daemon

use anyhow::{Context, Result};
use crossterm::terminal;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use ssh_tunnel_common::remote::{RemoteSession, RemoteTerminal, TerminalRequest, WindowSize};
use ssh_tunnel_common::{HostProfile, RusshConnector, SessionError, SshSettings, UnlockSecret};

/// Restores cooked mode on drop, including on early returns
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("Failed to put terminal into raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Terminal request matching the local terminal
pub fn local_terminal_request() -> TerminalRequest {
    let mut request = TerminalRequest::default();
    if let Ok(term) = std::env::var("TERM") {
        if !term.is_empty() {
            request.term = term;
        }
    }
    if let Some(size) = local_window_size() {
        request.cols = size.cols;
        request.rows = size.rows;
    }
    request
}

fn local_window_size() -> Option<WindowSize> {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => Some(WindowSize {
            cols: cols.into(),
            rows: rows.into(),
        }),
        _ => None,
    }
}

/// Local window size after every SIGWINCH
#[cfg(unix)]
fn watch_window_size() -> (mpsc::UnboundedReceiver<WindowSize>, Option<JoinHandle<()>>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (tx, rx) = mpsc::unbounded_channel();
    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            debug!("Window size changes will not be tracked: {}", e);
            return (rx, None);
        }
    };
    let task = tokio::spawn(async move {
        while winch.recv().await.is_some() {
            if let Some(size) = local_window_size() {
                if tx.send(size).is_err() {
                    break;
                }
            }
        }
    });
    (rx, Some(task))
}

#[cfg(not(unix))]
fn watch_window_size() -> (mpsc::UnboundedReceiver<WindowSize>, Option<JoinHandle<()>>) {
    let (_tx, rx) = mpsc::unbounded_channel();
    (rx, None)
}

/// Connect to the profile's host and attach the local terminal to a remote shell
pub async fn run_shell(
    profile: &HostProfile,
    settings: SshSettings,
    secret: &UnlockSecret,
) -> Result<(), SessionError> {
    let connector = RusshConnector::new(settings);
    let session = connector.open(profile, secret).await?;

    let terminal = match session.open_terminal(&local_terminal_request()).await {
        Ok(terminal) => terminal,
        Err(e) => {
            session.close().await;
            return Err(e);
        }
    };

    let bridged = match RawModeGuard::enable() {
        Ok(_guard) => {
            let (window_changes, watcher) = watch_window_size();
            bridge(
                terminal,
                tokio::io::stdin(),
                tokio::io::stdout(),
                window_changes,
            )
            .await;
            if let Some(watcher) = watcher {
                watcher.abort();
            }
            Ok(())
        }
        Err(e) => Err(SessionError::Channel(e.to_string())),
    };

    session.close().await;
    bridged
}

/// Copy between the remote terminal and local stdio until the remote side ends
/// or local input closes. Local window changes are passed on as they arrive.
async fn bridge<I, O>(
    terminal: RemoteTerminal,
    mut input: I,
    mut output: O,
    mut window_changes: mpsc::UnboundedReceiver<WindowSize>,
) where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let RemoteTerminal { stream, resizer } = terminal;
    let (mut remote_read, mut remote_write) = tokio::io::split(stream);

    let input_closed = {
        let to_local = tokio::io::copy(&mut remote_read, &mut output);
        let to_remote = tokio::io::copy(&mut input, &mut remote_write);
        tokio::pin!(to_local, to_remote);

        loop {
            tokio::select! {
                result = &mut to_local => {
                    debug!("Remote terminal closed: {:?}", result);
                    break false;
                }
                result = &mut to_remote => {
                    debug!("Local input closed: {:?}", result);
                    break true;
                }
                Some(size) = window_changes.recv() => {
                    if !resizer.resize(size) {
                        debug!("Remote terminal gone, dropping window change");
                    }
                }
            }
        }
    };

    if input_closed {
        let _ = remote_write.shutdown().await;
    }
    let _ = output.flush().await;
}
