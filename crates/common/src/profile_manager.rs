// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - Profile Manager Module
// Shared profile I/O operations for CLI and Daemon

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{validate_profile_name, HostProfile};
use crate::error::{Error, Result};

/// Read-only profile lookup, as the daemon needs it
pub trait ProfileSource: Send + Sync {
    /// Look up a profile by name; `Ok(None)` if it does not exist
    fn lookup(&self, name: &str) -> Result<Option<HostProfile>>;
}

/// Get the default profiles directory path
pub fn profiles_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    Ok(config_dir.join("ssh-tunnel-manager").join("profiles"))
}

/// Directory of `<name>.toml` profile files
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at the default profiles directory
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(profiles_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn profile_path(&self, name: &str) -> Result<PathBuf> {
        validate_profile_name(name)?;
        Ok(self.dir.join(format!("{}.toml", name)))
    }

    /// Load all profiles, sorted by name. Unreadable files are skipped with a warning.
    pub fn load_all_profiles(&self) -> Result<Vec<HostProfile>> {
        if !self.dir.exists() {
            debug!("Profiles directory does not exist: {}", self.dir.display());
            return Ok(Vec::new());
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();

            // Skip non-TOML files
            if path.extension().and_then(|s| s.to_str()) != Some("toml") {
                continue;
            }

            match load_profile(&path) {
                Ok(profile) => {
                    debug!("Loaded profile: {}", profile.name());
                    profiles.push(profile);
                }
                Err(e) => {
                    warn!("Failed to load profile {}: {}", path.display(), e);
                }
            }
        }

        profiles.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(profiles)
    }

    /// Load a single profile by its name
    pub fn load_profile_by_name(&self, name: &str) -> Result<HostProfile> {
        let path = self.profile_path(name)?;
        if !path.exists() {
            return Err(Error::ProfileNotFound(name.to_string()));
        }
        load_profile(&path)
    }

    /// Check if a profile with the given name exists
    pub fn profile_exists_by_name(&self, name: &str) -> bool {
        self.profile_path(name)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    /// Save a profile to disk
    ///
    /// # Arguments
    /// * `profile` - The profile to save
    /// * `overwrite` - If true, overwrite existing profile. If false, error if exists.
    ///
    /// # Returns
    /// The path where the profile was saved
    pub fn save_profile(&self, profile: &HostProfile, overwrite: bool) -> Result<PathBuf> {
        profile.validate()?;
        let path = self.profile_path(profile.name())?;

        if !overwrite && path.exists() {
            return Err(Error::ProfileExists(profile.name().to_string()));
        }

        fs::create_dir_all(&self.dir)?;
        let toml_content = toml::to_string_pretty(profile)?;
        fs::write(&path, toml_content)?;

        // Profiles may hold passwords
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }

        debug!("Saved profile '{}' to {}", profile.name(), path.display());
        Ok(path)
    }

    /// Delete a profile from disk by name
    pub fn delete_profile_by_name(&self, name: &str) -> Result<PathBuf> {
        let path = self.profile_path(name)?;
        if !path.exists() {
            return Err(Error::ProfileNotFound(name.to_string()));
        }

        fs::remove_file(&path)?;
        debug!("Deleted profile at {}", path.display());
        Ok(path)
    }
}

impl ProfileSource for ProfileStore {
    fn lookup(&self, name: &str) -> Result<Option<HostProfile>> {
        match self.load_profile_by_name(name) {
            Ok(profile) => Ok(Some(profile)),
            Err(Error::ProfileNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Load a single profile from a path
pub fn load_profile(path: &Path) -> Result<HostProfile> {
    let contents = fs::read_to_string(path)?;
    let profile: HostProfile = toml::from_str(&contents)?;
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::types::{AuthType, TunnelSpec};
    use tempfile::TempDir;

    fn create_test_profile(name: &str) -> HostProfile {
        HostProfile::new(
            name,
            ConnectionConfig {
                host: "test.example.com".to_string(),
                port: 22,
                user: "testuser".to_string(),
                auth_type: AuthType::Key,
                key_path: Some("/home/user/.ssh/id_rsa".into()),
                password: None,
            },
        )
    }

    #[test]
    fn test_profiles_dir() {
        let dir = profiles_dir().expect("Should get profiles directory");
        assert!(dir.to_string_lossy().contains("ssh-tunnel-manager"));
        assert!(dir.to_string_lossy().contains("profiles"));
    }

    #[test]
    fn test_load_all_profiles_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProfileStore::new(temp_dir.path().join("nope"));
        assert!(store.load_all_profiles().unwrap().is_empty());
    }

    #[test]
    fn test_save_load_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProfileStore::new(temp_dir.path());

        store.save_profile(&create_test_profile("web"), false).unwrap();
        store.save_profile(&create_test_profile("box1"), false).unwrap();

        let names: Vec<String> = store
            .load_all_profiles()
            .unwrap()
            .into_iter()
            .map(|p| p.metadata.name)
            .collect();
        assert_eq!(names, vec!["box1", "web"]);

        let loaded = store.load_profile_by_name("box1").unwrap();
        assert_eq!(loaded.connection.host, "test.example.com");
        assert!(store.profile_exists_by_name("box1"));

        store.delete_profile_by_name("box1").unwrap();
        assert!(!store.profile_exists_by_name("box1"));
        assert!(matches!(
            store.load_profile_by_name("box1"),
            Err(Error::ProfileNotFound(_))
        ));
    }

    #[test]
    fn test_save_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProfileStore::new(temp_dir.path());

        store.save_profile(&create_test_profile("box1"), false).unwrap();
        assert!(matches!(
            store.save_profile(&create_test_profile("box1"), false),
            Err(Error::ProfileExists(_))
        ));
        assert!(store.save_profile(&create_test_profile("box1"), true).is_ok());
    }

    #[test]
    fn test_saved_tunnels_survive_reload() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProfileStore::new(temp_dir.path());

        let mut profile = create_test_profile("box1");
        profile
            .add_tunnel(TunnelSpec::new(8080, "10.0.0.5", 80))
            .unwrap();
        profile
            .add_tunnel(TunnelSpec::new(5432, "db.internal", 5432))
            .unwrap();
        store.save_profile(&profile, false).unwrap();

        let mut loaded = store.load_profile_by_name("box1").unwrap();
        assert_eq!(loaded.tunnels, profile.tunnels);

        assert!(loaded.remove_tunnel(&TunnelSpec::new(8080, "10.0.0.5", 80)));
        store.save_profile(&loaded, true).unwrap();
        let reloaded = store.load_profile_by_name("box1").unwrap();
        assert_eq!(
            reloaded.tunnels,
            vec![TunnelSpec::new(5432, "db.internal", 5432)]
        );
    }

    #[test]
    fn test_lookup_missing_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProfileStore::new(temp_dir.path());
        assert!(store.lookup("ghost").unwrap().is_none());
    }

    #[test]
    fn test_skips_unparsable_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProfileStore::new(temp_dir.path());
        store.save_profile(&create_test_profile("good"), false).unwrap();
        fs::write(temp_dir.path().join("broken.toml"), "not = [valid").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let profiles = store.load_all_profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name(), "good");
    }
}
