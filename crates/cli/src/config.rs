// SSH Tunnel Manager - CLI Config Module
// Handles CLI configuration for reaching the daemon and opening shells

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ssh_tunnel_common::remote::known_hosts::KnownHosts;
pub use ssh_tunnel_common::DaemonClientConfig;
use ssh_tunnel_common::SshSettings;

/// CLI configuration (wrapper around DaemonClientConfig with file I/O)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub daemon_config: DaemonClientConfig,

    /// Settings for `ssh-tunnel shell`, which connects directly
    #[serde(default)]
    pub shell: ShellConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShellConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Defaults to the known_hosts file the daemon uses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    #[serde(default = "default_accept_new_host_keys")]
    pub accept_new_host_keys: bool,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_accept_new_host_keys() -> bool {
    true
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            known_hosts_path: None,
            accept_new_host_keys: default_accept_new_host_keys(),
        }
    }
}

impl ShellConfig {
    pub fn ssh_settings(&self) -> Result<SshSettings> {
        let known_hosts_path = match &self.known_hosts_path {
            Some(path) => path.clone(),
            None => KnownHosts::default_path()?,
        };
        Ok(SshSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            known_hosts_path,
            accept_new_host_keys: self.accept_new_host_keys,
        })
    }
}

impl CliConfig {
    /// Load CLI configuration from file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            // Return default config if file doesn't exist
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read CLI configuration")?;

        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).context("Failed to parse CLI configuration")?;

        config
            .daemon_config
            .control_addr()
            .context("daemon_host must be a loopback address")?;

        Ok(config)
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("ssh-tunnel-manager").join("cli.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(config.daemon_config.daemon_host, "127.0.0.1");
        assert_eq!(config.daemon_config.daemon_port, 31337);
        assert_eq!(config.daemon_config.retry_delay(), Duration::from_millis(2000));
        assert!(config.shell.accept_new_host_keys);
    }

    #[test]
    fn test_parse_flattened_fields() {
        let config = CliConfig::parse(
            r#"
daemon_port = 40100
retry_delay_ms = 250

[shell]
connect_timeout_secs = 3
known_hosts_path = "/tmp/kh"
"#,
        )
        .unwrap();

        assert_eq!(config.daemon_config.daemon_port, 40100);
        assert_eq!(config.daemon_config.retry_delay(), Duration::from_millis(250));

        let settings = config.shell.ssh_settings().unwrap();
        assert_eq!(settings.connect_timeout, Duration::from_secs(3));
        assert_eq!(settings.keepalive_interval, Duration::from_secs(30));
        assert_eq!(settings.known_hosts_path, PathBuf::from("/tmp/kh"));
    }

    #[test]
    fn test_rejects_remote_daemon_host() {
        let err = CliConfig::parse("daemon_host = \"10.1.2.3\"").unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }
}
