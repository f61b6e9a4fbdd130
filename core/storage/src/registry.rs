//! Store registry for resolving a backend from configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::DurableStore;
use outpost_common::{Error, Result};

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn DurableStore>> + Send + Sync>;

/// Which backend to open and with what options.
///
/// ```json
/// { "backend": "sqlite", "options": { "path": "/var/lib/outpost/outpost.db" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: String,
    #[serde(default)]
    pub options: Value,
}

impl StoreConfig {
    /// In-memory store; nothing survives the process.
    pub fn memory() -> Self {
        Self {
            backend: "memory".to_string(),
            options: Value::Null,
        }
    }

    /// SQLite database at `path`.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: "sqlite".to_string(),
            options: serde_json::json!({ "path": path.into() }),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::memory()
    }
}

/// Registry for store factories.
///
/// Allows applications to plug in their own backends next to the built-in
/// ones and pick one by name at startup.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Store backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Open a store described by `config`.
    ///
    /// # Errors
    /// - Backend not registered
    /// - Options invalid for the backend
    /// - Backend failed to open
    pub fn open(&self, config: &StoreConfig) -> Result<Arc<dyn DurableStore>> {
        let factory = self.factories.get(&config.backend).ok_or_else(|| {
            Error::NotFound(format!("Store backend '{}' is not registered", config.backend))
        })?;
        factory(&config.options)
    }

    /// Get list of registered backend names.
    pub fn backends(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in backends.
pub fn create_default_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();

    registry.factories.insert(
        "memory".to_string(),
        Box::new(|_options: &Value| {
            let store: Arc<dyn DurableStore> = Arc::new(crate::memory::MemoryStore::new());
            Ok(store)
        }),
    );

    registry.factories.insert(
        "sqlite".to_string(),
        Box::new(|options: &Value| {
            let path = options
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::InvalidInput("sqlite backend requires a 'path' option".to_string())
                })?;
            let store: Arc<dyn DurableStore> = Arc::new(crate::sqlite::SqliteStore::open(path)?);
            Ok(store)
        }),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry();
        let mut backends = registry.backends();
        backends.sort();
        assert_eq!(backends, vec!["memory", "sqlite"]);
    }

    #[test]
    fn test_open_memory() {
        let registry = create_default_registry();
        let store = registry.open(&StoreConfig::memory()).unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_open_sqlite() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.db");
        let registry = create_default_registry();

        let store = registry
            .open(&StoreConfig::sqlite(path.to_string_lossy()))
            .unwrap();
        assert_eq!(store.name(), "sqlite");
    }

    #[test]
    fn test_sqlite_requires_path() {
        let registry = create_default_registry();
        let config = StoreConfig {
            backend: "sqlite".to_string(),
            options: Value::Null,
        };
        assert!(matches!(registry.open(&config), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_unknown_backend() {
        let registry = create_default_registry();
        let config = StoreConfig {
            backend: "indexeddb".to_string(),
            options: Value::Null,
        };
        assert!(matches!(registry.open(&config), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = create_default_registry();
        let result = registry.register(
            "memory",
            Box::new(|_: &Value| {
                let store: Arc<dyn DurableStore> = Arc::new(crate::memory::MemoryStore::new());
                Ok(store)
            }),
        );
        assert!(result.is_err());
    }
}
