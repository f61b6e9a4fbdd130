//! Drains the mutation queue against the remote service.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use outpost_common::{Clock, Error, Result};

use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::dead_letter::{DeadLetter, DeadLetterStore};
use crate::queue::{MutationQueue, QueuedMutation};
use crate::remote::RemoteExecutor;
use crate::scheduler::{SyncScheduler, SyncSchedulerHandle};

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub succeeded: usize,
    pub retried: usize,
    /// Dead letters settled in this pass: recorded and out of the queue.
    pub dead_lettered: Vec<DeadLetter>,
    /// Snapshot entries left queued without a recorded outcome: not
    /// attempted because connectivity or storage failed, or failed for good
    /// but not yet moved to the dead-letter store.
    pub remaining: usize,
    /// Last storage error hit while recording outcomes, if any.
    pub storage_error: Option<String>,
    pub duration: Duration,
}

impl SyncSummary {
    pub fn dead_lettered_count(&self) -> usize {
        self.dead_lettered.len()
    }

    /// Whether every attempted entry succeeded.
    pub fn is_clean(&self) -> bool {
        self.retried == 0 && self.dead_lettered.is_empty() && self.storage_error.is_none()
    }
}

/// What a drain trigger led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A pass ran to the end of its snapshot (or until connectivity dropped).
    Completed(SyncSummary),
    /// Another pass held the guard; this trigger was ignored.
    AlreadyRunning,
    /// Not online; nothing was attempted.
    Offline,
}

/// Callback receiving the summary of every completed pass.
pub type SummaryListener = Arc<dyn Fn(&SyncSummary) + Send + Sync>;

/// Marks a pass as running for as long as it is alive.
struct DrainingFlag<'a>(&'a AtomicBool);

impl<'a> DrainingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for DrainingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Replays queued mutations, at most one pass at a time.
pub struct SyncEngine {
    queue: Arc<MutationQueue>,
    dead_letters: Arc<DeadLetterStore>,
    remote: Arc<dyn RemoteExecutor>,
    monitor: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    /// Held for the duration of a pass.
    drain_lock: Mutex<()>,
    /// Set only while the guard is held; read by status queries.
    draining: AtomicBool,
    listeners: StdRwLock<Vec<SummaryListener>>,
    last_sync_at: StdRwLock<Option<DateTime<Utc>>>,
    /// Transition stream, subscribed at construction and handed to the
    /// scheduler once.
    events: StdMutex<Option<broadcast::Receiver<ConnectivityEvent>>>,
}

impl SyncEngine {
    /// Create an engine. Subscribes to `monitor` immediately so no
    /// transition between construction and scheduler start is lost.
    pub fn new(
        queue: Arc<MutationQueue>,
        dead_letters: Arc<DeadLetterStore>,
        remote: Arc<dyn RemoteExecutor>,
        monitor: Arc<ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let events = monitor.subscribe();

        Self {
            queue,
            dead_letters,
            remote,
            monitor,
            clock,
            config,
            drain_lock: Mutex::new(()),
            draining: AtomicBool::new(false),
            listeners: StdRwLock::new(Vec::new()),
            last_sync_at: StdRwLock::new(None),
            events: StdMutex::new(Some(events)),
        }
    }

    /// Build the scheduler that drives drains from connectivity events,
    /// the periodic timer and backoff.
    ///
    /// # Errors
    /// - `Scheduler` if called more than once
    pub fn init_scheduler(self: &Arc<Self>) -> Result<(SyncScheduler, SyncSchedulerHandle)> {
        let events = match self.events.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let events = events
            .ok_or_else(|| Error::Scheduler("Scheduler already initialized".to_string()))?;

        Ok(SyncScheduler::new(self.clone(), events))
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register a callback for pass summaries.
    pub fn on_sync_summary<F>(&self, callback: F)
    where
        F: Fn(&SyncSummary) + Send + Sync + 'static,
    {
        let listener: SummaryListener = Arc::new(callback);
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// Whether a pass is running right now. Never touches the drain guard.
    pub fn is_syncing(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// When the last pass completed.
    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        match self.last_sync_at.read() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Run one drain pass over the queue as it is right now.
    ///
    /// Entries enqueued while the pass runs wait for the next one. Each
    /// snapshot entry gets at most one attempt.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the queue cannot be read
    pub async fn drain(&self) -> Result<DrainOutcome> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already in progress; ignoring trigger");
            return Ok(DrainOutcome::AlreadyRunning);
        };
        let _draining = DrainingFlag::raise(&self.draining);

        if !self.monitor.is_online().await {
            debug!("Offline; skipping drain");
            return Ok(DrainOutcome::Offline);
        }

        let start = Instant::now();
        let snapshot = self.queue.list().await?;
        let mut summary = SyncSummary::default();

        info!("Starting drain of {} queued mutations", snapshot.len());

        let batch_size = self.config.batch_size.max(1);
        for (index, mutation) in snapshot.iter().enumerate() {
            if index > 0 && index % batch_size == 0 {
                tokio::time::sleep(self.config.batch_pause()).await;
            }

            if !self.monitor.is_online().await {
                let left = snapshot.len() - index;
                summary.remaining += left;
                info!("Connectivity lost mid-drain; leaving {} mutations queued", left);
                break;
            }

            if let Err(e) = self.replay(mutation, &mut summary).await {
                let left = snapshot.len() - index;
                summary.remaining += left;
                error!(
                    "Cannot record replay attempts; leaving {} mutations queued: {}",
                    left, e
                );
                summary.storage_error = Some(e.to_string());
                break;
            }
        }

        summary.duration = start.elapsed();
        self.finish(&summary);

        Ok(DrainOutcome::Completed(summary))
    }

    /// Settle one snapshot entry.
    ///
    /// The attempt is written to the queue before the remote call, so an
    /// entry whose outcome is lost still counts against its ceiling.
    ///
    /// # Errors
    /// - the storage error if the attempt cannot be recorded; no remote
    ///   call is made and the pass should stop
    async fn replay(&self, mutation: &QueuedMutation, summary: &mut SyncSummary) -> Result<()> {
        if mutation.is_exhausted() {
            warn!(
                "{} used its last attempt without a recorded outcome",
                mutation.id
            );
            let reason = "Retry ceiling reached; outcome of the final attempt unknown".to_string();
            self.dead_letter(mutation, mutation.attempts_made(), reason, summary)
                .await;
            return Ok(());
        }

        let Some(started) = self.queue.begin_attempt(&mutation.id).await? else {
            debug!("{} left the queue before replay", mutation.id);
            return Ok(());
        };

        debug!(
            "Replaying {} {} ({}), attempt {}/{}",
            mutation.operation, mutation.target, mutation.id, started.attempts, started.max_retries
        );

        let error = match self.remote.execute(&started).await {
            Ok(()) => {
                if let Err(e) = self.queue.remove(&mutation.id).await {
                    error!(
                        "Replayed {} but could not remove it from the queue: {}",
                        mutation.id, e
                    );
                    summary.storage_error = Some(e.to_string());
                }
                summary.succeeded += 1;
                return Ok(());
            }
            Err(e) => e,
        };

        if !error.is_transient() || started.is_exhausted() {
            self.dead_letter(mutation, started.attempts, error.to_string(), summary)
                .await;
            return Ok(());
        }

        debug!("Replay of {} failed: {}", mutation.id, error);
        match self.queue.increment_retry(&mutation.id).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!("{} left the queue during replay", mutation.id),
            Err(e) => {
                error!("Failed to record retry for {}: {}", mutation.id, e);
                summary.storage_error = Some(e.to_string());
            }
        }
        summary.retried += 1;
        Ok(())
    }

    /// Move a failed entry to the dead-letter store. It is only reported
    /// once it is both recorded there and out of the queue; otherwise it
    /// stays queued, exhausted, and the next pass settles it without a
    /// further remote call.
    async fn dead_letter(
        &self,
        mutation: &QueuedMutation,
        attempts: u32,
        reason: String,
        summary: &mut SyncSummary,
    ) {
        let letter = self.dead_letters.letter(mutation, attempts, reason);

        let settled = match self.dead_letters.record(&letter).await {
            Ok(()) => self.queue.remove(&mutation.id).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = settled {
            error!("Could not dead-letter {}; keeping it queued: {}", mutation.id, e);
            summary.storage_error = Some(e.to_string());
            summary.remaining += 1;
            return;
        }

        warn!(
            "Dead-lettered {} after {} attempt(s): {}",
            mutation.id, attempts, letter.reason
        );
        summary.dead_lettered.push(letter);
    }

    fn finish(&self, summary: &SyncSummary) {
        info!(
            "Drain completed in {:?}: {} succeeded, {} retried, {} dead-lettered, {} remaining",
            summary.duration,
            summary.succeeded,
            summary.retried,
            summary.dead_lettered.len(),
            summary.remaining
        );

        let now = self.clock.now();
        match self.last_sync_at.write() {
            Ok(mut last) => *last = Some(now),
            Err(poisoned) => *poisoned.into_inner() = Some(now),
        }

        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            listener(summary);
        }
    }
}
