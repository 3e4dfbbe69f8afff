// SSH Tunnel Manager - Daemon Config Module
// Control listener, tunnel binding, and SSH session settings

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use ssh_tunnel_common::protocol::{DEFAULT_CONTROL_PORT, DEFAULT_MAX_LINE_LENGTH};
use ssh_tunnel_common::{loopback_socket_addr, SshSettings};

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Control listener host. Only loopback addresses are accepted.
    #[serde(default = "default_control_host")]
    pub control_host: String,

    /// Control listener port
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Local address tunnel listeners bind to
    #[serde(default = "default_tunnel_bind_address")]
    pub tunnel_bind_address: String,

    /// Longest accepted control line in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// SSH connect timeout
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// SSH keepalive interval
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Path to SSH known_hosts file
    /// Default: ~/.config/ssh-tunnel-manager/known_hosts
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,

    /// Trust unknown host keys on first connection
    #[serde(default = "default_accept_new_host_keys")]
    pub accept_new_host_keys: bool,

    /// Directory of host profiles
    #[serde(default = "default_profiles_dir")]
    pub profiles_dir: PathBuf,
}

fn config_base() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ssh-tunnel-manager")
}

fn default_control_host() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_tunnel_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_known_hosts_path() -> PathBuf {
    config_base().join("known_hosts")
}

fn default_accept_new_host_keys() -> bool {
    true
}

fn default_profiles_dir() -> PathBuf {
    config_base().join("profiles")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            control_host: default_control_host(),
            control_port: default_control_port(),
            tunnel_bind_address: default_tunnel_bind_address(),
            max_line_length: default_max_line_length(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            known_hosts_path: default_known_hosts_path(),
            accept_new_host_keys: default_accept_new_host_keys(),
            profiles_dir: default_profiles_dir(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        // The control channel carries no authentication of its own
        self.control_addr().context(
            "Security violation: the control listener must bind to a loopback address",
        )?;
        self.tunnel_bind_ip()?;

        if self.max_line_length == 0 {
            anyhow::bail!("max_line_length must be greater than zero");
        }
        Ok(())
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(loopback_socket_addr(&self.control_host, self.control_port)?)
    }

    pub fn tunnel_bind_ip(&self) -> Result<IpAddr> {
        if self.tunnel_bind_address.eq_ignore_ascii_case("localhost") {
            return Ok(IpAddr::from([127, 0, 0, 1]));
        }
        self.tunnel_bind_address.parse().with_context(|| {
            format!(
                "Invalid tunnel_bind_address '{}'",
                self.tunnel_bind_address
            )
        })
    }

    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            known_hosts_path: self.known_hosts_path.clone(),
            accept_new_host_keys: self.accept_new_host_keys,
        }
    }

    /// Load daemon configuration from file, falling back to defaults
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!(
                "No daemon configuration at {}, using defaults",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read daemon configuration")?;
        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("ssh-tunnel-manager").join("daemon.toml"))
    }
}
