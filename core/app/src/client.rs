//! The offline client: one explicitly owned context for the whole pipeline.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use outpost_common::{Clock, Error, MutationId, OperationKind, Result, SystemClock, Target};
use outpost_storage::{create_default_registry, DurableStore, StoreRegistry};
use outpost_sync::{
    CacheFreshnessTracker, ConnectivityMonitor, ConnectivitySnapshot, DeadLetter,
    DeadLetterStore, DrainOutcome, MutationQueue, PlatformSignal, QueuedMutation, ReachabilityProbe, RemoteExecutor,
    SyncEngine, SyncScheduler, SyncSummary,
};

use crate::config::ClientConfig;
use crate::settings::UserSettings;

/// Point-in-time view of the client for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub is_online: bool,
    pub offline_duration: Option<Duration>,
    /// Pending mutations, or `None` if storage could not be read.
    pub pending: Option<usize>,
    /// Unacknowledged dead letters, or `None` if storage could not be read.
    pub failed: Option<usize>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub syncing: bool,
}

/// Bytes used per store namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageUsage {
    pub queue: u64,
    pub dead_letters: u64,
    pub cache: u64,
    pub settings: u64,
}

impl StorageUsage {
    pub fn total(&self) -> u64 {
        self.queue + self.dead_letters + self.cache + self.settings
    }
}

/// Background tasks started by [`OfflineClient::start`].
struct Running {
    scheduler: SyncScheduler,
    tasks: Vec<JoinHandle<()>>,
}

/// Builder for [`OfflineClient`].
pub struct OfflineClientBuilder {
    config: ClientConfig,
    registry: StoreRegistry,
    store: Option<Arc<dyn DurableStore>>,
    clock: Arc<dyn Clock>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    remote: Option<Arc<dyn RemoteExecutor>>,
    initially_online: bool,
}

impl OfflineClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            registry: create_default_registry(),
            store: None,
            clock: Arc::new(SystemClock),
            probe: None,
            remote: None,
            initially_online: false,
        }
    }

    /// Use a custom registry to resolve `config.store`.
    pub fn with_registry(mut self, registry: StoreRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use an already-open store instead of resolving `config.store`.
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteExecutor>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// The platform's connectivity signal at startup. Defaults to offline
    /// until the first probe says otherwise.
    pub fn initially_online(mut self, online: bool) -> Self {
        self.initially_online = online;
        self
    }

    /// Assemble the client.
    ///
    /// # Preconditions
    /// - A probe and a remote executor must be supplied
    ///
    /// # Postconditions
    /// - Mutations already in the store are pending again
    /// - No background task is running until [`OfflineClient::start`]
    ///
    /// # Errors
    /// - `InvalidInput` if the probe or remote is missing
    /// - `NotFound` if `config.store` names an unregistered backend
    /// - `StorageUnavailable` if the store cannot be opened
    pub fn build(self) -> Result<OfflineClient> {
        let probe = self
            .probe
            .ok_or_else(|| Error::InvalidInput("A reachability probe is required".to_string()))?;
        let remote = self
            .remote
            .ok_or_else(|| Error::InvalidInput("A remote executor is required".to_string()))?;

        let store = match self.store {
            Some(store) => store,
            None => self.registry.open(&self.config.store)?,
        };

        let queue = Arc::new(MutationQueue::new(
            store.clone(),
            self.clock.clone(),
            self.config.sync.max_retries,
        ));
        let monitor = Arc::new(ConnectivityMonitor::new(
            self.initially_online,
            probe,
            self.clock.clone(),
            self.config.monitor.clone(),
        ));
        let dead_letters = Arc::new(DeadLetterStore::new(store.clone(), self.clock.clone()));
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            dead_letters.clone(),
            remote,
            monitor.clone(),
            self.clock.clone(),
            self.config.sync.clone(),
        ));
        let cache = Arc::new(CacheFreshnessTracker::new(store.clone(), self.clock.clone()));
        let settings = UserSettings::new(store.clone(), self.clock.clone());

        info!("Offline client ready on {} store", store.name());

        Ok(OfflineClient {
            config: self.config,
            queue,
            dead_letters,
            monitor,
            engine,
            cache,
            settings,
            running: Mutex::new(None),
        })
    }
}

/// Entry point for the surrounding application.
///
/// Owns the queue, connectivity monitor, sync engine and cache. Callers
/// enqueue mutations and read cached values; the client drains the queue
/// whenever it is online.
pub struct OfflineClient {
    config: ClientConfig,
    queue: Arc<MutationQueue>,
    dead_letters: Arc<DeadLetterStore>,
    monitor: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
    cache: Arc<CacheFreshnessTracker>,
    settings: UserSettings,
    running: Mutex<Option<Running>>,
}

impl OfflineClient {
    pub fn builder(config: ClientConfig) -> OfflineClientBuilder {
        OfflineClientBuilder::new(config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start the connectivity monitor and the drain scheduler.
    ///
    /// `platform_signals` is optional; without it the active probe alone
    /// decides connectivity.
    ///
    /// # Errors
    /// - `Scheduler` if the client was already started
    pub async fn start(&self, platform_signals: Option<mpsc::Receiver<PlatformSignal>>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Scheduler("Client already started".to_string()));
        }

        let (scheduler, mut handle) = self.engine.init_scheduler()?;
        if self.config.cache.evict_on_reconnect {
            handle = handle.with_cache_eviction(self.cache.clone(), self.config.cache.max_age());
        }

        let monitor_task = tokio::spawn(
            self.monitor
                .clone()
                .run(platform_signals, scheduler.shutdown_signal()),
        );
        let scheduler_task = tokio::spawn(handle.run());

        *running = Some(Running {
            scheduler,
            tasks: vec![monitor_task, scheduler_task],
        });

        info!("Offline client started");
        Ok(())
    }

    /// Stop background tasks. A drain in progress finishes first.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.scheduler.shutdown();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        info!("Offline client stopped");
    }

    /// Queue a mutation for replay. Never waits on connectivity.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the store rejects the write
    pub async fn enqueue_mutation(
        &self,
        operation: OperationKind,
        target: Target,
        payload: Vec<u8>,
    ) -> Result<MutationId> {
        let id = self
            .queue
            .enqueue(operation, target, payload)
            .await
            .inspect_err(|e| warn!("Could not buffer mutation: {}", e))?;

        // The mutation is already safe; a failed trim only costs space.
        if let Err(e) = self.enforce_storage_limit().await {
            warn!("Could not enforce storage limit: {}", e);
        }
        Ok(id)
    }

    pub async fn get_connectivity(&self) -> ConnectivitySnapshot {
        self.monitor.snapshot().await
    }

    /// Probe the remote service now instead of waiting for the next
    /// interval.
    pub async fn check_connectivity(&self) -> ConnectivitySnapshot {
        self.monitor.probe_once().await;
        self.monitor.snapshot().await
    }

    /// Feed a platform connectivity signal directly.
    pub async fn handle_platform_signal(&self, signal: PlatformSignal) {
        self.monitor.handle_signal(signal).await;
    }

    /// Number of pending (non-dead-lettered) mutations.
    pub async fn get_queue_depth(&self) -> Result<usize> {
        self.queue.len().await
    }

    /// Pending mutations in replay order.
    pub async fn pending_mutations(&self) -> Result<Vec<QueuedMutation>> {
        self.queue.list().await
    }

    /// Drain now. A no-op if a drain is already running or the client is
    /// offline.
    pub async fn request_sync_now(&self) -> Result<DrainOutcome> {
        self.engine.drain().await
    }

    /// Register a callback for every completed drain pass.
    pub fn on_sync_summary<F>(&self, callback: F)
    where
        F: Fn(&SyncSummary) + Send + Sync + 'static,
    {
        self.engine.on_sync_summary(callback);
    }

    pub async fn cache_store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.cache.store(key, value).await?;
        self.enforce_storage_limit().await?;
        Ok(())
    }

    pub async fn cache_load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.cache.load(key).await
    }

    /// Load a cached value only if it is no older than `max_age`.
    pub async fn cache_load_fresh(&self, key: &str, max_age: Duration) -> Result<Option<Vec<u8>>> {
        self.cache.load_fresh(key, max_age).await
    }

    pub async fn cache_is_stale(&self, key: &str, max_age: Duration) -> Result<bool> {
        self.cache.is_stale(key, max_age).await
    }

    pub async fn cache_invalidate(&self, key: &str) -> Result<bool> {
        self.cache.invalidate(key).await
    }

    /// Evict cache entries past the configured horizon.
    pub async fn cache_evict(&self) -> Result<usize> {
        self.cache.evict_older_than(self.config.cache.max_age()).await
    }

    pub async fn set_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.settings.set(key, value).await
    }

    pub async fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.settings.get(key).await
    }

    pub async fn remove_setting(&self, key: &str) -> Result<bool> {
        self.settings.remove(key).await
    }

    /// Mutations that failed permanently and have not been acknowledged,
    /// oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.dead_letters.list().await
    }

    /// Dismiss one dead letter. Returns whether it was present.
    pub async fn acknowledge_dead_letter(&self, id: &MutationId) -> Result<bool> {
        self.dead_letters.acknowledge(id).await
    }

    /// Dismiss every dead letter. Returns how many were removed.
    pub async fn clear_dead_letters(&self) -> Result<usize> {
        self.dead_letters.clear().await
    }

    /// Trim the oldest cached values once total usage passes
    /// `cache.max_storage_bytes`. Returns how many entries were removed.
    pub async fn enforce_storage_limit(&self) -> Result<usize> {
        let limit = self.config.cache.max_storage_bytes;
        if limit == 0 {
            return Ok(0);
        }

        let total = self.storage_usage().await?.total();
        if total <= limit {
            return Ok(0);
        }

        let removed = self
            .cache
            .trim_oldest(total - self.config.cache.trim_target())
            .await?;

        let total = self.storage_usage().await?.total();
        if total > limit {
            warn!(
                "Storage still at {} of {} bytes after trimming the cache",
                total, limit
            );
        }
        Ok(removed)
    }

    /// Bytes stored per namespace.
    pub async fn storage_usage(&self) -> Result<StorageUsage> {
        Ok(StorageUsage {
            queue: self.queue.size().await?,
            dead_letters: self.dead_letters.size().await?,
            cache: self.cache.size().await?,
            settings: self.settings.size().await?,
        })
    }

    /// Connectivity, queue depth and sync activity in one view.
    ///
    /// Storage failures degrade `pending` to `None` instead of failing.
    pub async fn status(&self) -> ClientStatus {
        let connectivity = self.monitor.snapshot().await;
        let pending = match self.queue.len().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                warn!("Queue depth unavailable: {}", e);
                None
            }
        };

        let failed = match self.dead_letters.len().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Dead letters unavailable: {}", e);
                None
            }
        };

        ClientStatus {
            is_online: connectivity.is_online,
            offline_duration: connectivity.offline_duration,
            pending,
            failed,
            last_sync_at: self.engine.last_sync_at(),
            syncing: self.engine.is_syncing(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_storage::{MemoryStore, StoreConfig};
    use outpost_sync::QUEUE_NAMESPACE;

    struct Unreachable;

    #[async_trait::async_trait]
    impl ReachabilityProbe for Unreachable {
        async fn check(&self) -> Result<()> {
            Err(Error::TransientRemote("no route".to_string()))
        }
    }

    struct Accepting;

    #[async_trait::async_trait]
    impl RemoteExecutor for Accepting {
        async fn execute(&self, _mutation: &QueuedMutation) -> Result<()> {
            Ok(())
        }
    }

    fn builder() -> OfflineClientBuilder {
        OfflineClient::builder(ClientConfig::default())
            .with_probe(Arc::new(Unreachable))
            .with_remote(Arc::new(Accepting))
    }

    #[tokio::test]
    async fn test_build_requires_probe_and_remote() {
        let err = OfflineClient::builder(ClientConfig::default())
            .with_remote(Arc::new(Accepting))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = OfflineClient::builder(ClientConfig::default())
            .with_probe(Arc::new(Unreachable))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_unknown_backend() {
        let config = ClientConfig {
            store: StoreConfig {
                backend: "indexeddb".to_string(),
                options: serde_json::Value::Null,
            },
            ..ClientConfig::default()
        };
        let err = OfflineClient::builder(config)
            .with_probe(Arc::new(Unreachable))
            .with_remote(Arc::new(Accepting))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_storage_usage_per_namespace() {
        let client = builder().build().unwrap();
        client
            .enqueue_mutation(OperationKind::Create, Target::collection("notices"), vec![0; 10])
            .await
            .unwrap();
        client.cache_store("courses", vec![0; 100]).await.unwrap();
        client.set_setting("theme", "dark").await.unwrap();

        let usage = client.storage_usage().await.unwrap();
        assert!(usage.queue > 10);
        assert_eq!(usage.cache, 100);
        assert_eq!(usage.settings, br#""dark""#.len() as u64);
        assert_eq!(usage.dead_letters, 0);
        assert_eq!(usage.total(), usage.queue + usage.cache + usage.settings);
    }

    #[tokio::test]
    async fn test_storage_limit_trims_oldest_cache_only() {
        let mut config = ClientConfig::default();
        config.cache.max_storage_bytes = 1_000;
        let clock = Arc::new(outpost_common::ManualClock::default());
        let client = OfflineClient::builder(config)
            .with_probe(Arc::new(Unreachable))
            .with_remote(Arc::new(Accepting))
            .with_clock(clock.clone())
            .build()
            .unwrap();

        client.cache_store("old", vec![0; 400]).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        client.cache_store("mid", vec![0; 400]).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        // 1 200 bytes: back down to 800 by dropping the oldest value.
        client.cache_store("new", vec![0; 400]).await.unwrap();

        assert!(client.cache_load("old").await.unwrap().is_none());
        assert!(client.cache_load("mid").await.unwrap().is_some());
        assert!(client.cache_load("new").await.unwrap().is_some());

        // Queued mutations are never trimmed, even past the limit.
        let id = client
            .enqueue_mutation(OperationKind::Create, Target::collection("a"), vec![0; 2_000])
            .await
            .unwrap();
        assert_eq!(client.pending_mutations().await.unwrap()[0].id, id);
        assert_eq!(client.storage_usage().await.unwrap().cache, 0);
    }

    #[tokio::test]
    async fn test_dead_letters_are_queryable_and_acknowledged() {
        struct Rejecting;

        #[async_trait::async_trait]
        impl RemoteExecutor for Rejecting {
            async fn execute(&self, _mutation: &QueuedMutation) -> Result<()> {
                Err(Error::PermanentRemote("422".to_string()))
            }
        }

        let store = MemoryStore::new();
        let open = || {
            OfflineClient::builder(ClientConfig::default())
                .with_store(Arc::new(store.clone()))
                .with_probe(Arc::new(Unreachable))
                .with_remote(Arc::new(Rejecting))
                .initially_online(true)
                .build()
                .unwrap()
        };

        let client = open();
        let id = client
            .enqueue_mutation(OperationKind::Update, Target::record("a", "1"), vec![])
            .await
            .unwrap();
        client.request_sync_now().await.unwrap();
        drop(client);

        // Still visible after a restart, with no listener ever registered.
        let client = open();
        let status = client.status().await;
        assert_eq!(status.pending, Some(0));
        assert_eq!(status.failed, Some(1));
        assert_eq!(client.dead_letters().await.unwrap()[0].mutation.id, id);
        assert!(client.storage_usage().await.unwrap().dead_letters > 0);

        assert!(client.acknowledge_dead_letter(&id).await.unwrap());
        assert_eq!(client.status().await.failed, Some(0));
        assert_eq!(client.clear_dead_letters().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_degrades_when_storage_fails() {
        let store = MemoryStore::new();
        let client = builder().with_store(Arc::new(store.clone())).build().unwrap();

        store.set_available(false);

        let err = client
            .enqueue_mutation(OperationKind::Create, Target::collection("a"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));

        let status = client.status().await;
        assert_eq!(status.pending, None);
        assert_eq!(status.failed, None);
        assert!(!status.is_online);
        assert!(!status.syncing);
    }

    #[tokio::test]
    async fn test_queue_uses_its_own_namespace() {
        let store = Arc::new(MemoryStore::new());
        let client = builder().with_store(store.clone()).build().unwrap();
        let id = client
            .enqueue_mutation(OperationKind::Delete, Target::record("a", "1"), vec![])
            .await
            .unwrap();

        assert!(store.get(QUEUE_NAMESPACE, id.as_str()).await.unwrap().is_some());
        assert_eq!(client.get_queue_depth().await.unwrap(), 1);
        assert_eq!(client.pending_mutations().await.unwrap()[0].id, id);
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_shutdown_is_idempotent() {
        let client = builder().build().unwrap();

        client.start(None).await.unwrap();
        assert!(matches!(
            client.start(None).await,
            Err(Error::Scheduler(_))
        ));

        client.shutdown().await;
        client.shutdown().await;
    }
}
