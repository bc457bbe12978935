//! Configuration loading and management
//!
//! Handles parsing of `.tasksync.toml` configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::remote::StoreLimits;

/// Default config file name, looked up in the current directory
pub const CONFIG_FILE: &str = ".tasksync.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// How the task collection is laid out in the remote store
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote store limits and location
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Storage layout and write scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Change-notification area the engine reacts to
    #[serde(default = "default_area")]
    pub area: String,

    /// Key prefix of collection fragments (`<prefix><index>`)
    #[serde(default = "default_fragment_prefix")]
    pub fragment_prefix: String,

    /// Key of the metadata record
    #[serde(default = "default_meta_key")]
    pub meta_key: String,

    /// Maximum bytes of serialized collection per fragment
    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,

    /// Quiet period before a scheduled write happens
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_area() -> String {
    "sync".to_string()
}

fn default_fragment_prefix() -> String {
    "tm_tasks_".to_string()
}

fn default_meta_key() -> String {
    "tm_meta".to_string()
}

fn default_fragment_size() -> usize {
    4000
}

fn default_debounce_ms() -> u64 {
    500
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            area: default_area(),
            fragment_prefix: default_fragment_prefix(),
            meta_key: default_meta_key(),
            fragment_size: default_fragment_size(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl StorageConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn fragment_key(&self, index: usize) -> String {
        format!("{}{}", self.fragment_prefix, index)
    }

    /// Whether `key` belongs to the persisted collection.
    pub fn owns_key(&self, key: &str) -> bool {
        key == self.meta_key
            || key
                .strip_prefix(&self.fragment_prefix)
                .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
    }
}

/// Remote store limits and location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Per-item ceiling in bytes (key + JSON value)
    #[serde(default = "default_item_quota_bytes")]
    pub item_quota_bytes: u64,

    /// Total quota in bytes
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,

    /// Store document for the file backend (defaults to the data dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Quiet period before re-reading the store after filesystem activity
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

fn default_item_quota_bytes() -> u64 {
    StoreLimits::SYNC.item_bytes
}

fn default_quota_bytes() -> u64 {
    StoreLimits::SYNC.total_bytes
}

fn default_watch_debounce_ms() -> u64 {
    200
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            item_quota_bytes: default_item_quota_bytes(),
            quota_bytes: default_quota_bytes(),
            path: None,
            watch_debounce_ms: default_watch_debounce_ms(),
        }
    }
}

impl RemoteConfig {
    pub fn limits(&self) -> StoreLimits {
        StoreLimits {
            item_bytes: self.item_quota_bytes,
            total_bytes: self.quota_bytes,
        }
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise return defaults
    pub fn load_or_default(path: &Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> crate::error::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        let storage = &self.storage;
        if storage.area.trim().is_empty() {
            return Err(invalid("storage.area cannot be empty"));
        }
        if storage.fragment_prefix.is_empty() {
            return Err(invalid("storage.fragment_prefix cannot be empty"));
        }
        if storage.meta_key.is_empty() {
            return Err(invalid("storage.meta_key cannot be empty"));
        }
        if storage.meta_key.starts_with(&storage.fragment_prefix) {
            return Err(crate::error::Error::InvalidConfig(format!(
                "storage.meta_key '{}' must not start with storage.fragment_prefix '{}'",
                storage.meta_key, storage.fragment_prefix
            )));
        }
        if storage.fragment_size == 0 {
            return Err(invalid("storage.fragment_size must be > 0"));
        }
        if storage.debounce_ms > 60_000 {
            return Err(invalid("storage.debounce_ms must be <= 60000"));
        }

        let remote = &self.remote;
        // Escaping can double a fragment once it is stored as a JSON string.
        let worst_item = (storage.fragment_size as u64)
            .saturating_mul(2)
            .saturating_add(storage.fragment_prefix.len() as u64)
            .saturating_add(MAX_INDEX_DIGITS + 2);
        if worst_item > remote.item_quota_bytes {
            return Err(crate::error::Error::InvalidConfig(format!(
                "storage.fragment_size ({}) is too large for remote.item_quota_bytes ({}); \
                 an escaped fragment may need {} bytes",
                storage.fragment_size, remote.item_quota_bytes, worst_item
            )));
        }
        if remote.quota_bytes < remote.item_quota_bytes {
            return Err(invalid(
                "remote.quota_bytes must be >= remote.item_quota_bytes",
            ));
        }
        Ok(())
    }
}

/// Digits in the largest fragment index a key can carry.
const MAX_INDEX_DIGITS: u64 = 20;

fn invalid(message: &str) -> crate::error::Error {
    crate::error::Error::InvalidConfig(message.to_string())
}
