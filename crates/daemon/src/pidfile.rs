// SSH Tunnel Manager - PID File Management
// Ensures only one daemon instance runs at a time

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Removes the PID file on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Claim the default PID file
    pub fn create() -> Result<Self> {
        Self::create_at(default_pid_file_path()?)
    }

    /// Claim the PID file at `path`.
    ///
    /// Fails if it names a live process; a stale file is replaced.
    pub fn create_at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(pid) = read_pid(&path) {
            if is_process_running(pid) {
                anyhow::bail!(
                    "Daemon is already running with PID {}. \
                     Stop the existing daemon first or remove {} if it's stale.",
                    pid,
                    path.display()
                );
            }
            warn!("Removing stale PID file for process {}", pid);
        }
        if path.exists() {
            fs::remove_file(&path).context("Failed to remove stale PID file")?;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create runtime directory")?;
        }

        let pid = std::process::id();
        fs::write(&path, pid.to_string()).context("Failed to write PID file")?;
        info!("Created PID file at {} with PID {}", path.display(), pid);

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(_) => debug!("Removed PID file: {}", self.path.display()),
            Err(e) => warn!("Failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}

/// `<runtime dir>/ssh-tunnel-manager/daemon.pid`, falling back to the cache dir
pub fn default_pid_file_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("daemon.pid"))
}

/// Per-user runtime directory for daemon state (PID file, log)
pub fn runtime_dir() -> Result<PathBuf> {
    let base = dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))?;
    Ok(base.join("ssh-tunnel-manager"))
}

fn read_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    match contents.trim().parse() {
        Ok(pid) => Some(pid),
        Err(_) => {
            warn!("Ignoring unreadable PID file {}", path.display());
            None
        }
    }
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // kill(pid, 0) checks for existence without signalling
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    warn!("Process existence check not implemented for this platform");
    true
}
