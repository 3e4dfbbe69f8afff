// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - Daemon Bootstrap
// Process hardening and the one-time unlock secret handoff on stdin

use std::io::IsTerminal;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use zeroize::Zeroizing;

use ssh_tunnel_common::UnlockSecret;

/// Set umask 0077 so every file the daemon creates is owner-only.
/// Call before creating any files.
pub fn set_restrictive_umask() {
    #[cfg(unix)]
    {
        unsafe {
            libc::umask(0o077);
        }
        debug!("Set restrictive umask: 0077");
    }
}

/// Read the unlock secret handed over by the launcher.
///
/// An interactive stdin means the daemon was started by hand; no secret is
/// read and an empty one is used.
pub async fn read_unlock_secret() -> Result<UnlockSecret> {
    if std::io::stdin().is_terminal() {
        info!("stdin is a terminal, starting without an unlock secret");
        return Ok(Zeroizing::new(String::new()));
    }

    let secret = read_secret_line(BufReader::new(tokio::io::stdin()))
        .await
        .context("Failed to read unlock secret from stdin")?;
    debug!("Unlock secret received ({} bytes)", secret.len());
    Ok(secret)
}

/// Read one line, without its line terminator. EOF yields an empty secret.
pub async fn read_secret_line<R: AsyncBufRead + Unpin>(mut reader: R) -> Result<UnlockSecret> {
    let mut line = Zeroizing::new(String::new());
    reader.read_line(&mut line).await?;

    let len = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(len);
    Ok(line)
}
