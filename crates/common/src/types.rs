// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// Common types for SSH Tunnel Manager

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Secret handed to the daemon once at start-up; unlocks stored credentials.
/// Wiped from memory on drop.
pub type UnlockSecret = Zeroizing<String>;

/// Authentication type for SSH connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// SSH key authentication
    Key,
    /// Password authentication
    Password,
}

/// One port forward: local `source_port` to `destination_host:destination_port`
/// as seen from the remote host.
///
/// The whole triple is the tunnel's identity within a profile. Ports travel
/// as decimal strings on the wire to match the persisted profile encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    #[serde(with = "port_string")]
    pub source_port: u16,
    pub destination_host: String,
    #[serde(with = "port_string")]
    pub destination_port: u16,
}

impl TunnelSpec {
    pub fn new(source_port: u16, destination_host: impl Into<String>, destination_port: u16) -> Self {
        Self {
            source_port,
            destination_host: destination_host.into(),
            destination_port,
        }
    }

    /// Build a spec from its textual fields, validating ports and host
    pub fn parse(source_port: &str, destination_host: &str, destination_port: &str) -> Result<Self> {
        let source_port = parse_port(source_port).ok_or_else(|| {
            Error::Validation("Source port must be a number between 1 and 65535".to_string())
        })?;
        let destination_port = parse_port(destination_port).ok_or_else(|| {
            Error::Validation("Destination port must be a number between 1 and 65535".to_string())
        })?;
        validate_host(destination_host)?;

        Ok(Self::new(source_port, destination_host.trim(), destination_port))
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}:{}",
            self.source_port, self.destination_host, self.destination_port
        )
    }
}

/// Parse a decimal port in 1..=65535. Only ASCII digits are accepted, no sign.
pub fn parse_port(value: &str) -> Option<u16> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match value.parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Some(port as u16),
        _ => None,
    }
}

/// Validate a host name or IP address
pub fn validate_host(host: &str) -> Result<()> {
    let host = host.trim();
    if host.is_empty() {
        return Err(Error::Validation("Host is required".to_string()));
    }
    if host.len() > 253 {
        return Err(Error::Validation(
            "Host is too long (max 253 characters)".to_string(),
        ));
    }

    let hostname_like = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if hostname_like || host.parse::<IpAddr>().is_ok() {
        Ok(())
    } else {
        Err(Error::Validation("Invalid host format".to_string()))
    }
}

/// Ports as decimal strings; numbers are accepted on input too
mod port_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&port.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let text = match RawPort::deserialize(deserializer)? {
            RawPort::Text(text) => text,
            RawPort::Number(number) => number.to_string(),
        };
        super::parse_port(&text)
            .ok_or_else(|| de::Error::custom(format!("invalid port: {}", text)))
    }
}
