//! Outpost Sync Engine
//!
//! This module provides the offline mutation pipeline for Outpost, including:
//! - Durable, strictly ordered mutation queue with retry bookkeeping
//! - Connectivity monitoring from platform signals and an active probe
//! - Drain passes with dead-lettering after a retry ceiling
//! - Persistent dead letters until acknowledged
//! - Reconnect, periodic and backoff-driven scheduling
//! - Cache freshness tracking with age-based eviction

pub mod backoff;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod dead_letter;
pub mod engine;
pub mod queue;
pub mod remote;
pub mod scheduler;

// Re-export main types
pub use backoff::{Backoff, BackoffConfig};
pub use cache::{CacheEntry, CacheFreshnessTracker, CACHE_NAMESPACE};
pub use config::{CacheConfig, MonitorConfig, SyncConfig};
pub use connectivity::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivitySnapshot, ConnectivityState,
    PlatformSignal, ReachabilityProbe, TransitionSource,
};
pub use dead_letter::{DeadLetter, DeadLetterStore, DEAD_LETTER_NAMESPACE};
pub use engine::{DrainOutcome, SummaryListener, SyncEngine, SyncSummary};
pub use queue::{MutationQueue, QueuedMutation, QUEUE_NAMESPACE};
pub use remote::RemoteExecutor;
pub use scheduler::{SyncScheduler, SyncSchedulerHandle};
