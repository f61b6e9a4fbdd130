//! Client configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use outpost_common::Result;
use outpost_storage::StoreConfig;
use outpost_sync::{CacheConfig, MonitorConfig, SyncConfig};

/// Everything an [`crate::OfflineClient`] needs to know up front.
///
/// Every section is optional in the JSON form:
///
/// ```json
/// {
///   "store": { "backend": "sqlite", "options": { "path": "outpost.db" } },
///   "sync": { "max_retries": 5 },
///   "monitor": { "probe_interval_ms": 10000 }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub monitor: MonitorConfig,
    pub cache: CacheConfig,
}

impl ClientConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Serialization` if it is not valid configuration JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
