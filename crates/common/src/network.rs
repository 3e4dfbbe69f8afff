// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// Network utility functions

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{Error, Result};

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    // Handle "localhost" as special case
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    // Try parsing as IpAddr (handles "127.0.0.1", "::1", etc.)
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Fail-safe: if we can't parse it, assume non-loopback for security
    false
}

/// Format `host:port`, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Resolve the control-channel address. Only loopback hosts are accepted:
/// the control channel is unauthenticated and must never leave the machine.
pub fn loopback_socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    if !is_loopback_address(host) {
        return Err(Error::Config(format!(
            "Control address must be a loopback address, got '{}'",
            host
        )));
    }

    let ip = if host.eq_ignore_ascii_case("localhost") {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        host.parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("Invalid control address '{}': {}", host, e)))?
    };

    Ok(SocketAddr::new(ip, port))
}
