//! Persisted user settings.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use outpost_common::{Clock, Result};
use outpost_storage::{DurableStore, Record};

/// Store namespace holding user settings, keyed by setting name.
pub const SETTINGS_NAMESPACE: &str = "settings";

/// Typed settings stored as JSON in the durable store.
pub struct UserSettings {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl UserSettings {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_vec(value)?;
        self.store
            .put(SETTINGS_NAMESPACE, Record::new(key, value, self.clock.now()))
            .await
    }

    /// # Errors
    /// - `Serialization` if the stored value does not decode as `T`
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(SETTINGS_NAMESPACE, key).await? {
            Some(record) => Ok(Some(serde_json::from_slice(&record.value)?)),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.store.delete(SETTINGS_NAMESPACE, key).await
    }

    pub async fn size(&self) -> Result<u64> {
        self.store.size_of(SETTINGS_NAMESPACE).await
    }
}
