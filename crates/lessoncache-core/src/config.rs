//! Application configuration management.
//!
//! Deployment settings only: where data lives, which remote to talk to, how
//! much storage the device grants. Learner-facing policy lives in
//! `EngineSettings` and is persisted by the engine.
//!
//! Configuration is stored at `~/.config/lessoncache/config.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::DEFAULT_MAX_CONCURRENT_DOWNLOADS;
use crate::monitor::ConnectionType;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "lessoncache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Storage granted to the engine when nothing is configured (2 GiB).
pub const DEFAULT_STORAGE_CAPACITY: u64 = 2 * 1024 * 1024 * 1024;

/// Seconds between connectivity probes in long-running mode.
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 30;

pub const ENV_REMOTE_URL: &str = "LESSONCACHE_REMOTE_URL";
pub const ENV_TOKEN: &str = "LESSONCACHE_TOKEN";
pub const ENV_USER: &str = "LESSONCACHE_USER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub api_token: Option<String>,
    pub user_id: Option<String>,
    /// Bytes of device storage the engine may account against.
    pub storage_capacity: u64,
    pub max_concurrent_downloads: usize,
    /// Refuse downloads that would push the footprint past `max_storage_size`.
    pub enforce_storage_ceiling: bool,
    /// How a reachable remote is classified for download admission.
    pub connection_type: ConnectionType,
    pub probe_interval_secs: u64,
    /// Daily-rotated log files are written here when set.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            remote_url: None,
            api_token: None,
            user_id: None,
            storage_capacity: DEFAULT_STORAGE_CAPACITY,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            enforce_storage_ceiling: false,
            connection_type: ConnectionType::Wifi,
            probe_interval_secs: DEFAULT_PROBE_INTERVAL_SECS,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding record families and media blobs.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Apply `LESSONCACHE_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v: &String| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_REMOTE_URL) {
            self.remote_url = Some(url);
        }
        if let Some(token) = non_empty(ENV_TOKEN) {
            self.api_token = Some(token);
        }
        if let Some(user) = non_empty(ENV_USER) {
            self.user_id = Some(user);
        }
    }
}
