// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// Configuration structures for SSH Tunnel Manager

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{validate_host, AuthType, TunnelSpec};

const INVALID_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Named remote host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProfile {
    #[serde(flatten)]
    pub metadata: ProfileMetadata,
    pub connection: ConnectionConfig,
    /// Tunnels remembered for this host; `start` without forwards uses these
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tunnels: Vec<TunnelSpec>,
}

/// Profile metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileMetadata {
    /// Profile name, also used as the file name and the control-protocol key
    pub name: String,
    /// Optional description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Profile creation timestamp
    pub created_at: DateTime<Utc>,
    /// Profile last modification timestamp
    pub modified_at: DateTime<Utc>,
}

/// SSH connection configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// SSH server hostname or IP
    pub host: String,
    /// SSH server port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username
    pub user: String,
    /// Authentication type
    pub auth_type: AuthType,
    /// Path to SSH private key (for key auth); `~` is expanded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    /// Password (for password auth). When absent the daemon's unlock secret is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// Keep passwords out of logs
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("auth_type", &self.auth_type)
            .field("key_path", &self.key_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_ssh_port() -> u16 {
    22
}

impl HostProfile {
    /// Create a new profile stamped with the current time
    pub fn new(name: impl Into<String>, connection: ConnectionConfig) -> Self {
        let now = Utc::now();
        Self {
            metadata: ProfileMetadata {
                name: name.into(),
                description: None,
                created_at: now,
                modified_at: now,
            },
            connection,
            tunnels: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// `user@host:port`
    pub fn target(&self) -> String {
        format!(
            "{}@{}",
            self.connection.user,
            crate::format_host_port(&self.connection.host, self.connection.port)
        )
    }

    /// Remember a tunnel. Two saved tunnels may not share a local port.
    pub fn add_tunnel(&mut self, spec: TunnelSpec) -> Result<()> {
        if let Some(existing) = self
            .tunnels
            .iter()
            .find(|t| t.source_port == spec.source_port)
        {
            return Err(Error::Validation(format!(
                "Local port {} is already used by saved tunnel {}",
                spec.source_port, existing
            )));
        }
        self.tunnels.push(spec);
        self.metadata.modified_at = Utc::now();
        Ok(())
    }

    /// Forget a saved tunnel. `false` if it was not saved.
    pub fn remove_tunnel(&mut self, spec: &TunnelSpec) -> bool {
        let before = self.tunnels.len();
        self.tunnels.retain(|t| t != spec);
        let removed = self.tunnels.len() != before;
        if removed {
            self.metadata.modified_at = Utc::now();
        }
        removed
    }

    /// Validate the profile configuration
    pub fn validate(&self) -> Result<()> {
        validate_profile_name(&self.metadata.name)?;
        validate_host(&self.connection.host)?;
        validate_user(&self.connection.user)?;

        if self.connection.port == 0 {
            return Err(Error::Validation(
                "Port must be an integer between 1 and 65535".to_string(),
            ));
        }

        if self.connection.auth_type == AuthType::Key && self.connection.key_path.is_none() {
            return Err(Error::Validation(
                "Key authentication requires a key path".to_string(),
            ));
        }

        for tunnel in &self.tunnels {
            validate_host(&tunnel.destination_host)?;
        }

        Ok(())
    }
}

/// Validate a profile name (it doubles as a file name)
pub fn validate_profile_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("Profile name is required".to_string()));
    }
    if name.chars().count() > 28 {
        return Err(Error::Validation(
            "Profile name is too long (max 28 characters)".to_string(),
        ));
    }
    if name.contains(INVALID_NAME_CHARS) {
        return Err(Error::Validation(
            "Profile name contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_user(user: &str) -> Result<()> {
    if user.trim().is_empty() {
        return Err(Error::Validation("Username is required".to_string()));
    }
    if user.chars().count() > 32 {
        return Err(Error::Validation(
            "Username is too long (max 32 characters)".to_string(),
        ));
    }
    if user.contains(INVALID_NAME_CHARS) {
        return Err(Error::Validation(
            "Username contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_profile(name: &str) -> HostProfile {
        HostProfile::new(
            name,
            ConnectionConfig {
                host: "box1.example.com".to_string(),
                port: 22,
                user: "deploy".to_string(),
                auth_type: AuthType::Key,
                key_path: Some(PathBuf::from("~/.ssh/id_ed25519")),
                password: None,
            },
        )
    }

    #[test]
    fn test_valid_profile() {
        assert!(key_profile("box1").validate().is_ok());
        assert_eq!(key_profile("box1").target(), "deploy@box1.example.com:22");
    }

    #[test]
    fn test_profile_name_rules() {
        assert!(key_profile("").validate().is_err());
        assert!(key_profile("a/b").validate().is_err());
        assert!(key_profile(&"x".repeat(29)).validate().is_err());
        assert!(key_profile(&"x".repeat(28)).validate().is_ok());
    }

    #[test]
    fn test_key_auth_requires_key_path() {
        let mut profile = key_profile("box1");
        profile.connection.key_path = None;
        let err = profile.validate().unwrap_err();
        assert!(err.to_string().contains("key path"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut profile = key_profile("box1");
        profile.connection.auth_type = AuthType::Password;
        profile.connection.password = Some("hunter2".to_string());
        let debug = format!("{:?}", profile);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_toml_round_trip_defaults_port() {
        let toml_text = r#"
name = "box1"
created_at = "2025-01-01T00:00:00Z"
modified_at = "2025-01-01T00:00:00Z"

[connection]
host = "10.0.0.1"
user = "root"
auth_type = "password"
"#;
        let profile: HostProfile = toml::from_str(toml_text).unwrap();
        assert_eq!(profile.connection.port, 22);
        assert_eq!(profile.connection.auth_type, AuthType::Password);
        assert!(profile.connection.password.is_none());
    }

    #[test]
    fn test_saved_tunnels() {
        let mut profile = key_profile("box1");
        let web = TunnelSpec::new(8080, "10.0.0.5", 80);
        let db = TunnelSpec::new(5432, "db.internal", 5432);

        profile.add_tunnel(web.clone()).unwrap();
        profile.add_tunnel(db.clone()).unwrap();
        assert_eq!(profile.tunnels, vec![web.clone(), db.clone()]);

        let err = profile
            .add_tunnel(TunnelSpec::new(8080, "10.0.0.6", 8080))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Local port 8080 is already used by saved tunnel 8080 -> 10.0.0.5:80"
        );

        assert!(profile.remove_tunnel(&web));
        assert!(!profile.remove_tunnel(&web));
        assert_eq!(profile.tunnels, vec![db]);
    }

    #[test]
    fn test_saved_tunnels_toml() {
        let mut profile = key_profile("box1");
        let text = toml::to_string(&profile).unwrap();
        assert!(!text.contains("tunnels"));

        profile
            .add_tunnel(TunnelSpec::new(8080, "10.0.0.5", 80))
            .unwrap();
        let text = toml::to_string(&profile).unwrap();
        let loaded: HostProfile = toml::from_str(&text).unwrap();
        assert_eq!(loaded.tunnels, vec![TunnelSpec::new(8080, "10.0.0.5", 80)]);
    }
}
