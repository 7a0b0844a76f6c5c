//! Application configuration.
//!
//! Loaded from a TOML file. Every field has a default so an empty or missing
//! file yields a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root for the per-store databases and the queue database.
    pub data_dir: PathBuf,
    pub remote: RemoteConfig,
    pub stores: StoresConfig,
    pub queues: QueuesConfig,
    pub sync: SyncConfig,
    pub accounting: AccountingConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("sitebook-data"),
            remote: RemoteConfig::default(),
            stores: StoresConfig::default(),
            queues: QueuesConfig::default(),
            sync: SyncConfig::default(),
            accounting: AccountingConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn stores_dir(&self) -> PathBuf {
        self.data_dir.join("stores")
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.data_dir.join("queues.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// WebSocket base URL; each store syncs at `<sync_url>/<store_id>`.
    pub sync_url: String,
    /// HTTP base URL for media and store-deletion requests.
    pub api_base_url: String,
    pub auth_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            sync_url: "ws://localhost:8048/sync".to_string(),
            api_base_url: "http://localhost:8048/api".to_string(),
            auth_token: None,
            request_timeout_secs: 30,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresConfig {
    pub prefix: String,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            prefix: "project".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub drain_interval_secs: u64,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            drain_interval_secs: 60 * 60,
        }
    }
}

impl QueuesConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_min_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    pub debounce_ms: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

impl AccountingConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
