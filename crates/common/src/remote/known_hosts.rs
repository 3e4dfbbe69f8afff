// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - Known Hosts Module
// Trust-on-first-use host key store in OpenSSH known_hosts format

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Outcome of checking a presented host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// A stored key for this host matches
    Trusted,
    /// No key stored for this host yet
    Unknown,
    /// A key is stored for this host and it differs
    Changed { line: usize },
}

#[derive(Debug, Clone)]
struct Entry {
    pattern: String,
    key_type: String,
    key_data: String,
    comment: Option<String>,
    line: usize,
}

impl Entry {
    fn parse(text: &str, line: usize) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            return None;
        }

        let mut fields = text.split_whitespace();
        let (Some(pattern), Some(key_type), Some(key_data)) =
            (fields.next(), fields.next(), fields.next())
        else {
            warn!("Ignoring malformed known_hosts line {}", line);
            return None;
        };
        let comment = fields.collect::<Vec<_>>().join(" ");

        Some(Self {
            pattern: pattern.to_string(),
            key_type: key_type.to_string(),
            key_data: key_data.to_string(),
            comment: (!comment.is_empty()).then_some(comment),
            line,
        })
    }

    /// A pattern may list several comma-separated hosts
    fn covers(&self, host: &str, port: u16) -> bool {
        let wanted = host_pattern(host, port);
        self.pattern
            .split(',')
            .any(|candidate| candidate == wanted || (port == 22 && candidate == host))
    }

    fn holds(&self, key: &PublicKey) -> bool {
        self.key_type == key.algorithm().as_str() && self.key_data == key.public_key_base64()
    }

    fn render(&self) -> String {
        match &self.comment {
            Some(comment) => format!(
                "{} {} {} {}",
                self.pattern, self.key_type, self.key_data, comment
            ),
            None => format!("{} {} {}", self.pattern, self.key_type, self.key_data),
        }
    }
}

/// In-memory view of a known_hosts file
#[derive(Debug)]
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<Entry>,
}

impl KnownHosts {
    /// Read the file at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = Vec::new();

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read known_hosts file {}", path.display()))?;
            entries.extend(
                contents
                    .lines()
                    .enumerate()
                    .filter_map(|(idx, text)| Entry::parse(text, idx + 1)),
            );
            debug!("Loaded {} known host keys from {}", entries.len(), path.display());
        }

        Ok(Self { path, entries })
    }

    /// `~/.config/ssh-tunnel-manager/known_hosts`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("ssh-tunnel-manager").join("known_hosts"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        let mut first_line = None;
        for entry in self.entries.iter().filter(|e| e.covers(host, port)) {
            if entry.holds(key) {
                return HostKeyStatus::Trusted;
            }
            first_line.get_or_insert(entry.line);
        }

        match first_line {
            Some(line) => HostKeyStatus::Changed { line },
            None => HostKeyStatus::Unknown,
        }
    }

    /// Record `key` for `host:port`; call `save` to persist
    pub fn remember(&mut self, host: &str, port: u16, key: &PublicKey) {
        let line = self.entries.last().map_or(1, |e| e.line + 1);
        self.entries.push(Entry {
            pattern: host_pattern(host, port),
            key_type: key.algorithm().as_str().to_string(),
            key_data: key.public_key_base64(),
            comment: None,
            line,
        });
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create known_hosts directory")?;
        }

        let mut file = fs::File::create(&self.path)
            .with_context(|| format!("Failed to write known_hosts file {}", self.path.display()))?;
        writeln!(file, "# SSH Tunnel Manager - Known Hosts")?;
        for entry in &self.entries {
            writeln!(file, "{}", entry.render())?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .context("Failed to set known_hosts file permissions")?;
        }

        info!("Saved {} known host keys to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

/// `host` on the default port, `[host]:port` otherwise
fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// OpenSSH-style `SHA256:...` fingerprint
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.public_key_bytes());
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
    const KEY_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAfuCHKVTjquxvt6CM6tdG4SLp1Btn/nOeHHE5UOzRdf";

    fn key(text: &str) -> PublicKey {
        PublicKey::from_openssh(text).unwrap()
    }

    #[test]
    fn test_host_pattern() {
        assert_eq!(host_pattern("example.com", 22), "example.com");
        assert_eq!(host_pattern("example.com", 2222), "[example.com]:2222");
    }

    #[test]
    fn test_entry_parse() {
        let entry = Entry::parse("a.example,b.example ssh-ed25519 AAAA some comment", 3).unwrap();
        assert_eq!(entry.key_type, "ssh-ed25519");
        assert_eq!(entry.comment.as_deref(), Some("some comment"));
        assert!(entry.covers("b.example", 22));
        assert!(!entry.covers("b.example", 2222));
        assert!(Entry::parse("# comment", 1).is_none());
        assert!(Entry::parse("host-only", 1).is_none());
    }

    #[test]
    fn test_trust_on_first_use() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("known_hosts");

        let mut store = KnownHosts::open(&path).unwrap();
        assert_eq!(store.check("box1", 22, &key(KEY_A)), HostKeyStatus::Unknown);

        store.remember("box1", 22, &key(KEY_A));
        store.save().unwrap();

        let reloaded = KnownHosts::open(&path).unwrap();
        assert_eq!(reloaded.check("box1", 22, &key(KEY_A)), HostKeyStatus::Trusted);
        assert_eq!(
            reloaded.check("box1", 22, &key(KEY_B)),
            HostKeyStatus::Changed { line: 2 }
        );
        assert_eq!(reloaded.check("box1", 2222, &key(KEY_A)), HostKeyStatus::Unknown);
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(&key(KEY_A));
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_ne!(fp, fingerprint(&key(KEY_B)));
    }
}
