//! In-memory durable store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::store::{validate, DurableStore, Record};
use outpost_common::{Error, Result};

/// Record plus its insertion sequence number.
#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    record: Record,
}

#[derive(Debug, Default)]
struct Inner {
    namespaces: HashMap<String, HashMap<String, Slot>>,
    next_seq: u64,
}

/// In-memory store.
///
/// Useful for testing and development. Data lives as long as any clone of
/// the store, so a clone handed to a second client simulates a restart.
/// Availability can be switched off to exercise storage failure paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call succeed (`true`) or fail with
    /// `StorageUnavailable` (`false`).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable(
                "memory store switched off".to_string(),
            ));
        }
        Ok(())
    }

    fn poisoned() -> Error {
        Error::StorageUnavailable("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, namespace: &str, record: Record) -> Result<()> {
        validate(namespace, Some(&record.key))?;
        self.check_available()?;

        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let seq = inner.next_seq;
        let ns = inner.namespaces.entry(namespace.to_string()).or_default();

        let inserted = match ns.get_mut(&record.key) {
            Some(slot) => {
                slot.record = record;
                false
            }
            None => {
                ns.insert(record.key.clone(), Slot { seq, record });
                true
            }
        };
        if inserted {
            inner.next_seq += 1;
        }
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>> {
        validate(namespace, Some(key))?;
        self.check_available()?;

        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(|slot| slot.record.clone()))
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        validate(namespace, Some(key))?;
        self.check_available()?;

        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        Ok(inner
            .namespaces
            .get_mut(namespace)
            .map(|ns| ns.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list_all(&self, namespace: &str) -> Result<Vec<Record>> {
        validate(namespace, None)?;
        self.check_available()?;

        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let mut slots: Vec<&Slot> = inner
            .namespaces
            .get(namespace)
            .map(|ns| ns.values().collect())
            .unwrap_or_default();
        slots.sort_by_key(|slot| slot.seq);

        Ok(slots.into_iter().map(|slot| slot.record.clone()).collect())
    }

    async fn delete_older_than(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        validate(namespace, None)?;
        self.check_available()?;

        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let Some(ns) = inner.namespaces.get_mut(namespace) else {
            return Ok(0);
        };

        let before = ns.len();
        ns.retain(|_, slot| slot.record.stored_at >= cutoff);
        Ok(before - ns.len())
    }
}
