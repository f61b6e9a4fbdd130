//! Outpost application layer.
//!
//! Wires the durable store, mutation queue, connectivity monitor, sync
//! engine and cache into a single [`OfflineClient`] owned by whatever drives
//! the application's lifecycle. There is no global state; create one client
//! per process and pass it around.

pub mod client;
pub mod config;
pub mod settings;

pub use client::{ClientStatus, OfflineClient, OfflineClientBuilder, StorageUsage};
pub use config::ClientConfig;
pub use settings::{UserSettings, SETTINGS_NAMESPACE};

pub use outpost_common::{Error, MutationId, OperationKind, Result, Target};
pub use outpost_sync::{
    ConnectivitySnapshot, DeadLetter, DrainOutcome, PlatformSignal, QueuedMutation,
    ReachabilityProbe, RemoteExecutor, SyncSummary,
};
