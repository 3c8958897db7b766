//! Configuration management for Clickrank.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{ClickrankError, Result};

/// Main configuration for the Clickrank service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClickrankConfig {
    /// Counter storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// SQLite journal mode for the counter database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Write-ahead log
    #[default]
    Wal,
    /// Rollback journal, deleted after each commit
    Delete,
}

impl JournalMode {
    /// The value passed to `PRAGMA journal_mode`.
    pub const fn pragma_value(self) -> &'static str {
        match self {
            JournalMode::Wal => "wal",
            JournalMode::Delete => "delete",
        }
    }
}

/// Counter storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Path to the legacy `name:count` file imported on startup
    #[serde(default = "default_legacy_path")]
    pub legacy_path: PathBuf,

    /// Seconds between durability syncs
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// How long a write waits on a locked database before failing
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    #[serde(default)]
    pub journal_mode: JournalMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            legacy_path: default_legacy_path(),
            sync_interval_secs: default_sync_interval(),
            busy_timeout_ms: default_busy_timeout(),
            journal_mode: JournalMode::default(),
        }
    }
}

impl StorageConfig {
    /// Interval of the periodic sync task.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("count.db")
}

fn default_legacy_path() -> PathBuf {
    PathBuf::from("count.txt")
}

fn default_sync_interval() -> u64 {
    5
}

fn default_busy_timeout() -> u64 {
    5000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Maximum requests per source key in one window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Seconds between sweeps of expired windows
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl RateLimitingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_limit() -> u64 {
    50
}

fn default_window_ms() -> u64 {
    1000
}

fn default_sweep_interval() -> u64 {
    60
}

impl ClickrankConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ClickrankError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
