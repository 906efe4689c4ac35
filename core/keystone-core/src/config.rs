//! Configuration loading and path management.
//!
//! Handles:
//! - Data directory layout (`~/.keystone/` by default, `KEYSTONE_HOME` to override)
//! - `config.json` (backend base URL and session timing policy)
//!
//! Tests use [`KeystonePaths::with_root`] to point everything at a temp dir.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs_err as fs;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

pub const HOME_ENV: &str = "KEYSTONE_HOME";
pub const BASE_URL_ENV: &str = "KEYSTONE_BASE_URL";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Every file Keystone reads or writes lives under one root.
#[derive(Debug, Clone)]
pub struct KeystonePaths {
    root: PathBuf,
}

impl KeystonePaths {
    /// Resolves the root from `KEYSTONE_HOME`, falling back to `~/.keystone`.
    pub fn resolve() -> Result<Self> {
        if let Some(root) = env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::with_root(PathBuf::from(root)));
        }
        let home = dirs::home_dir().ok_or(SessionError::HomeDirNotFound)?;
        Ok(Self::with_root(home.join(".keystone")))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared session storage (tokens, last activity).
    pub fn store_file(&self) -> PathBuf {
        self.root.join("store.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// The single timing policy every session component reads.
///
/// The warning dialog appears after `idle_timeout` without interaction and the
/// session ends `warning_countdown` later, so an idle session lives for
/// `idle_timeout + warning_countdown` in total. Token freshness is handled
/// separately by `refresh_lead`/`expiry_check_interval` and never ends a session
/// on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    pub idle_timeout_secs: u64,
    pub warning_countdown_secs: u64,
    pub refresh_lead_secs: u64,
    pub expiry_check_interval_secs: u64,
    pub activity_throttle_ms: u64,
    pub storage_poll_interval_ms: u64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 14 * 60,
            warning_countdown_secs: 60,
            refresh_lead_secs: 5 * 60,
            expiry_check_interval_secs: 60,
            activity_throttle_ms: 500,
            storage_poll_interval_ms: 250,
        }
    }
}

impl SessionPolicy {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn refresh_lead(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_lead_secs as i64)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval_secs.max(1))
    }

    pub fn activity_throttle(&self) -> Duration {
        Duration::from_millis(self.activity_throttle_ms)
    }

    pub fn storage_poll_interval(&self) -> Duration {
        Duration::from_millis(self.storage_poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoneConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub policy: SessionPolicy,
}

impl Default for KeystoneConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 30,
            policy: SessionPolicy::default(),
        }
    }
}

impl KeystoneConfig {
    /// Loads `config.json`, returning defaults if the file doesn't exist, then
    /// applies environment overrides.
    pub fn load(paths: &KeystonePaths) -> Result<Self> {
        let path = paths.config_file();
        let mut config = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Self::default(),
            Ok(content) => {
                serde_json::from_str(&content).map_err(|err| SessionError::ConfigMalformed {
                    path: path.clone(),
                    details: err.to_string(),
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                return Err(SessionError::ConfigMalformed {
                    path,
                    details: err.to_string(),
                })
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, paths: &KeystonePaths) -> Result<()> {
        let path = paths.config_file();
        let write_err = |source| SessionError::ConfigWriteFailed {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(paths.root()).map_err(write_err)?;
        let content = serde_json::to_string_pretty(self).map_err(|err| {
            SessionError::ConfigMalformed {
                path: path.clone(),
                details: err.to_string(),
            }
        })?;
        fs::write(&path, content).map_err(write_err)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var(BASE_URL_ENV) {
            let url = url.trim();
            if !url.is_empty() {
                self.base_url = url.to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SessionError::InvalidBaseUrl {
                url: self.base_url.clone(),
                details: "must start with http:// or https://".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
