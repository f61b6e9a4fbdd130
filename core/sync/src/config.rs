//! Tunables for the sync engine, connectivity monitor and cache.
//!
//! Durations are stored as milliseconds so config files stay readable.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::BackoffConfig;

/// Configuration for the sync engine and scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed attempts after which a mutation is dead-lettered.
    pub max_retries: u32,
    /// Entries replayed before pausing within one drain pass.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_pause_ms: u64,
    /// Periodic drain interval while online. Zero disables periodic drains.
    pub sync_interval_ms: u64,
    /// Delay before re-draining after a pass that left retried entries.
    pub backoff: BackoffConfig,
}

impl SyncConfig {
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_ms > 0).then(|| Duration::from_millis(self.sync_interval_ms))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            batch_size: 10,
            batch_pause_ms: 100,
            sync_interval_ms: 30_000,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Configuration for the connectivity monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How often the active reachability probe runs.
    pub probe_interval_ms: u64,
    /// How long a single probe may take before it counts as unreachable.
    pub probe_timeout_ms: u64,
}

impl MonitorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
        }
    }
}

/// Configuration for the cache freshness tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Global eviction horizon.
    pub max_age_ms: u64,
    /// Run an eviction pass on every reconnect.
    pub evict_on_reconnect: bool,
    /// Storage budget across all namespaces in bytes. Past it, the oldest
    /// cached values are trimmed until usage is back to 80%. Pending
    /// mutations and dead letters are never trimmed. 0 disables the cap.
    pub max_storage_bytes: u64,
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    /// Usage to trim back down to once the budget is exceeded.
    pub fn trim_target(&self) -> u64 {
        self.max_storage_bytes / 10 * 8
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 7 * 24 * 60 * 60 * 1000,
            evict_on_reconnect: true,
            max_storage_bytes: 50 * 1024 * 1024,
        }
    }
}
