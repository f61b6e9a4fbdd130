//! Cached reads with freshness tracking.
//!
//! Purely local bookkeeping over the durable store; nothing here talks to
//! the remote service. Freshness is derived from `stored_at` on every query.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use outpost_common::{Clock, Error, Result};
use outpost_storage::{DurableStore, Record};

/// Store namespace holding cached values, keyed by caller key.
pub const CACHE_NAMESPACE: &str = "cache";

/// A cached value and when it was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl From<Record> for CacheEntry {
    fn from(record: Record) -> Self {
        Self {
            key: record.key,
            value: record.value,
            stored_at: record.stored_at,
        }
    }
}

/// Answers "can I trust this cached read" without a network round trip.
pub struct CacheFreshnessTracker {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl CacheFreshnessTracker {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Store or overwrite a value, stamping it with the current time.
    pub async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let record = Record::new(key, value, self.clock.now());
        self.store.put(CACHE_NAMESPACE, record).await
    }

    /// Load a value regardless of its age.
    pub async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entry(key).await?.map(|entry| entry.value))
    }

    /// Load a value together with its timestamp.
    pub async fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self
            .store
            .get(CACHE_NAMESPACE, key)
            .await?
            .map(CacheEntry::from))
    }

    /// `true` if the key is missing or older than `max_age`.
    pub async fn is_stale(&self, key: &str, max_age: Duration) -> Result<bool> {
        match self.entry(key).await? {
            Some(entry) => self.is_older_than(&entry, max_age),
            None => Ok(true),
        }
    }

    /// Load a value only if it is no older than `max_age`.
    ///
    /// A stale value is deleted on the way out.
    pub async fn load_fresh(&self, key: &str, max_age: Duration) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.entry(key).await? else {
            return Ok(None);
        };

        if self.is_older_than(&entry, max_age)? {
            debug!("Dropping stale cache entry {}", key);
            self.store.delete(CACHE_NAMESPACE, key).await?;
            return Ok(None);
        }

        Ok(Some(entry.value))
    }

    /// Remove a single entry.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        self.store.delete(CACHE_NAMESPACE, key).await
    }

    /// Delete every entry older than `max_age`. Returns how many were removed.
    pub async fn evict_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = self.clock.now() - to_chrono(max_age)?;
        let removed = self.store.delete_older_than(CACHE_NAMESPACE, cutoff).await?;
        if removed > 0 {
            info!("Evicted {} cache entries older than {:?}", removed, max_age);
        }
        Ok(removed)
    }

    /// Delete the oldest entries until at least `bytes` have been freed.
    /// Returns how many were removed.
    pub async fn trim_oldest(&self, bytes: u64) -> Result<usize> {
        let mut records = self.store.list_all(CACHE_NAMESPACE).await?;
        records.sort_by_key(|record| record.stored_at);

        let mut freed = 0u64;
        let mut removed = 0;
        for record in records {
            if freed >= bytes {
                break;
            }
            if self.store.delete(CACHE_NAMESPACE, &record.key).await? {
                freed += record.size() as u64;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Trimmed {} cache entries ({} bytes)", removed, freed);
        }
        Ok(removed)
    }

    /// Number of cached entries.
    pub async fn len(&self) -> Result<usize> {
        self.store.count(CACHE_NAMESPACE).await
    }

    /// Check if the cache is empty.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Total size of cached values in bytes.
    pub async fn size(&self) -> Result<u64> {
        self.store.size_of(CACHE_NAMESPACE).await
    }

    /// Ages are compared in whole milliseconds, the precision every
    /// backend keeps `stored_at` at.
    fn is_older_than(&self, entry: &CacheEntry, max_age: Duration) -> Result<bool> {
        let age_ms = self.clock.now().timestamp_millis() - entry.stored_at.timestamp_millis();
        let max_age_ms = to_chrono(max_age)?.num_milliseconds();
        Ok(age_ms > max_age_ms)
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| Error::InvalidInput(format!("Duration out of range: {:?}", duration)))
}
