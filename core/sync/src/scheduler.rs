//! Sync scheduling - reconnect, periodic and backoff-driven drains.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::cache::CacheFreshnessTracker;
use crate::connectivity::ConnectivityEvent;
use crate::engine::{DrainOutcome, SyncEngine};

/// Controls a running scheduler.
pub struct SyncScheduler {
    shutdown: watch::Sender<bool>,
}

impl SyncScheduler {
    pub(crate) fn new(
        engine: Arc<SyncEngine>,
        events: broadcast::Receiver<ConnectivityEvent>,
    ) -> (Self, SyncSchedulerHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = Backoff::new(engine.config().backoff.clone());

        let handle = SyncSchedulerHandle {
            engine,
            events,
            shutdown: shutdown_rx,
            backoff,
            cache: None,
        };

        (
            Self {
                shutdown: shutdown_tx,
            },
            handle,
        )
    }

    /// Receiver that flips to `true` on shutdown, for sibling tasks.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop the scheduler. An in-flight pass finishes first.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

struct CacheEviction {
    tracker: Arc<CacheFreshnessTracker>,
    max_age: Duration,
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    engine: Arc<SyncEngine>,
    events: broadcast::Receiver<ConnectivityEvent>,
    shutdown: watch::Receiver<bool>,
    backoff: Backoff,
    cache: Option<CacheEviction>,
}

impl SyncSchedulerHandle {
    /// Evict cache entries older than `max_age` on every reconnect, before
    /// the drain.
    pub fn with_cache_eviction(mut self, tracker: Arc<CacheFreshnessTracker>, max_age: Duration) -> Self {
        self.cache = Some(CacheEviction { tracker, max_age });
        self
    }

    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. Returns once shutdown is
    /// signalled or the connectivity monitor is dropped.
    pub async fn run(mut self) {
        let mut periodic = self.create_periodic_interval();
        let mut retry_at: Option<Instant> = None;

        info!("Sync scheduler started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                event = self.events.recv() => {
                    match event {
                        Ok(event) if event.online => {
                            self.backoff.reset();
                            self.evict_cache().await;
                            retry_at = self.drain().await;
                        }
                        Ok(_) => {
                            debug!("Went offline; dropping pending retry");
                            self.backoff.reset();
                            retry_at = None;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Missed {} connectivity events", skipped);
                            if self.engine.monitor().is_online().await {
                                retry_at = self.drain().await;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    if self.engine.monitor().is_online().await {
                        debug!("Triggering periodic drain");
                        retry_at = self.drain().await;
                    }
                }

                _ = Self::wait_for_retry(retry_at) => {
                    debug!(
                        "Retrying after {} pass(es) with failures",
                        self.backoff.consecutive_failures()
                    );
                    retry_at = self.drain().await;
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Run a pass and decide when the next backoff-driven pass is due.
    async fn drain(&mut self) -> Option<Instant> {
        match self.engine.drain().await {
            Ok(DrainOutcome::Completed(summary)) => {
                if summary.retried > 0 && summary.remaining == 0 {
                    let delay = self.backoff.record_failure();
                    debug!("Next drain in {:?}", delay);
                    Some(Instant::now() + delay)
                } else {
                    self.backoff.reset();
                    None
                }
            }
            Ok(DrainOutcome::AlreadyRunning) => {
                debug!("Drain already running; scheduler trigger skipped");
                None
            }
            Ok(DrainOutcome::Offline) => None,
            Err(e) => {
                error!("Drain failed: {}", e);
                None
            }
        }
    }

    async fn evict_cache(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = cache.tracker.evict_older_than(cache.max_age).await {
            warn!("Cache eviction failed: {}", e);
        }
    }

    fn create_periodic_interval(&self) -> Option<Interval> {
        let period = self.engine.config().sync_interval()?;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    async fn wait_for_periodic(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    async fn wait_for_retry(retry_at: Option<Instant>) {
        match retry_at {
            Some(at) => sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}
