//! Durable store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outpost_common::{Error, Result};

/// A single keyed record inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Caller-defined key, unique within its namespace.
    pub key: String,
    /// Opaque record body.
    pub value: Vec<u8>,
    /// When the record was last written. Drives `delete_older_than`.
    pub stored_at: DateTime<Utc>,
}

impl Record {
    /// Create a new record.
    pub fn new(key: impl Into<String>, value: Vec<u8>, stored_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            value,
            stored_at,
        }
    }

    /// Size of the record body in bytes.
    pub fn size(&self) -> usize {
        self.value.len()
    }
}

/// Key/value storage that survives process restarts.
///
/// Implementations must keep each namespace's insertion order: a key keeps
/// its position when it is overwritten, and new keys go to the end.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Insert or overwrite a record.
    ///
    /// # Postconditions
    /// - `get(namespace, &record.key)` returns the record
    /// - An existing key keeps its insertion position
    ///
    /// # Errors
    /// - `StorageUnavailable` on backend I/O failure
    async fn put(&self, namespace: &str, record: Record) -> Result<()>;

    /// Get a record by key.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// List every record in a namespace, oldest insertion first.
    async fn list_all(&self, namespace: &str) -> Result<Vec<Record>>;

    /// Delete every record whose `stored_at` is strictly before `cutoff`.
    ///
    /// Returns the number of records removed.
    async fn delete_older_than(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Count records in a namespace.
    async fn count(&self, namespace: &str) -> Result<usize> {
        Ok(self.list_all(namespace).await?.len())
    }

    /// Total body size of a namespace in bytes.
    async fn size_of(&self, namespace: &str) -> Result<u64> {
        Ok(self
            .list_all(namespace)
            .await?
            .iter()
            .map(|r| r.size() as u64)
            .sum())
    }
}

/// Reject empty namespaces and keys before they reach a backend.
pub(crate) fn validate(namespace: &str, key: Option<&str>) -> Result<()> {
    if namespace.is_empty() {
        return Err(Error::InvalidInput("Namespace cannot be empty".to_string()));
    }
    if let Some(key) = key {
        if key.is_empty() {
            return Err(Error::InvalidInput("Record key cannot be empty".to_string()));
        }
    }
    Ok(())
}
