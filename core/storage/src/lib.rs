//! Durable storage for Outpost.
//!
//! This module provides a trait-based interface over local embedded storage
//! and a registry for resolving a backend from configuration.
//!
//! # Design Principles
//! - Namespaced records: queue entries, cache entries and settings share one store
//! - Insertion order: `list_all` returns records in the order their keys were first written
//! - Async operations: all calls are async even when the backend blocks internally
//! - Unified error semantics: every backend failure surfaces as `StorageUnavailable`

pub mod memory;
pub mod registry;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use registry::{create_default_registry, StoreConfig, StoreFactory, StoreRegistry};
pub use sqlite::SqliteStore;
pub use store::{DurableStore, Record};
