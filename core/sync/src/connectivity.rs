//! Online/offline tracking with an active reachability probe.
//!
//! The platform's connectivity signal can be wrong (a captive network, a
//! route that never reaches the service), so the monitor also probes the
//! service itself on a fixed interval. Both sources feed the same two-state
//! machine; transitions are broadcast to subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use outpost_common::{Clock, Error, Result};

use crate::config::MonitorConfig;

/// Lightweight check against the remote service.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// `Ok(())` if the service answered.
    async fn check(&self) -> Result<()>;
}

/// Online/offline signal reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformSignal {
    Online,
    Offline,
}

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionSource {
    Platform,
    Probe,
}

/// A change between ONLINE and OFFLINE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityEvent {
    /// New state: `true` for ONLINE.
    pub online: bool,
    pub at: DateTime<Utc>,
    pub source: TransitionSource,
}

/// Last known connectivity. Process-wide, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityState {
    pub is_online: bool,
    pub last_online_at: Option<DateTime<Utc>>,
    pub last_offline_at: Option<DateTime<Utc>>,
}

impl ConnectivityState {
    fn initial(is_online: bool, now: DateTime<Utc>) -> Self {
        Self {
            is_online,
            last_online_at: is_online.then_some(now),
            last_offline_at: (!is_online).then_some(now),
        }
    }

    /// How long the process has been without connectivity. `None` while
    /// online.
    pub fn offline_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.is_online {
            return None;
        }
        let since = self.last_online_at.or(self.last_offline_at)?;
        (now - since).to_std().ok()
    }
}

/// Point-in-time view handed to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub is_online: bool,
    pub offline_duration: Option<Duration>,
}

/// Tracks ONLINE/OFFLINE and publishes transitions.
pub struct ConnectivityMonitor {
    state: RwLock<ConnectivityState>,
    probe: Arc<dyn ReachabilityProbe>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    /// Create a monitor seeded from the platform's current signal.
    pub fn new(
        initially_online: bool,
        probe: Arc<dyn ReachabilityProbe>,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let state = ConnectivityState::initial(initially_online, clock.now());

        Self {
            state: RwLock::new(state),
            probe,
            clock,
            config,
            events,
        }
    }

    /// Subscribe to transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Last known state.
    pub async fn is_online(&self) -> bool {
        self.state.read().await.is_online
    }

    /// Full state including transition timestamps.
    pub async fn state(&self) -> ConnectivityState {
        self.state.read().await.clone()
    }

    /// Online flag plus derived offline duration.
    pub async fn snapshot(&self) -> ConnectivitySnapshot {
        let state = self.state.read().await;
        ConnectivitySnapshot {
            is_online: state.is_online,
            offline_duration: state.offline_duration(self.clock.now()),
        }
    }

    /// Apply a platform signal. Repeating the current state is a no-op.
    pub async fn handle_signal(&self, signal: PlatformSignal) -> Option<ConnectivityEvent> {
        let online = matches!(signal, PlatformSignal::Online);
        self.transition(online, TransitionSource::Platform).await
    }

    /// Run the reachability probe once and apply its verdict.
    ///
    /// Errors and timeouts both mean "not reachable"; neither escapes.
    pub async fn probe_once(&self) -> Option<ConnectivityEvent> {
        let reachable = match self.run_probe().await {
            Ok(()) => true,
            Err(Error::ProbeTimeout(limit)) => {
                warn!("Reachability probe timed out after {:?}", limit);
                false
            }
            Err(e) => {
                debug!("Reachability probe failed: {}", e);
                false
            }
        };
        self.transition(reachable, TransitionSource::Probe).await
    }

    async fn run_probe(&self) -> Result<()> {
        let limit = self.config.probe_timeout();
        match timeout(limit, self.probe.check()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ProbeTimeout(limit)),
        }
    }

    async fn transition(&self, online: bool, source: TransitionSource) -> Option<ConnectivityEvent> {
        let event = {
            let mut state = self.state.write().await;
            if state.is_online == online {
                return None;
            }

            let now = self.clock.now();
            state.is_online = online;
            if online {
                state.last_online_at = Some(now);
            } else {
                state.last_offline_at = Some(now);
            }

            ConnectivityEvent {
                online,
                at: now,
                source,
            }
        };

        info!(
            "Connectivity changed to {} ({:?})",
            if online { "ONLINE" } else { "OFFLINE" },
            source
        );
        // No subscribers is fine; the state itself is already updated.
        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// Run the monitor until `shutdown` flips to `true`.
    ///
    /// Probes immediately, then every `probe_interval`. Platform signals are
    /// applied as they arrive; the probe keeps working without them.
    pub async fn run(
        self: Arc<Self>,
        mut signals: Option<mpsc::Receiver<PlatformSignal>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Connectivity monitor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    self.probe_once().await;
                }

                signal = next_signal(&mut signals) => {
                    match signal {
                        Some(signal) => {
                            self.handle_signal(signal).await;
                        }
                        None => {
                            debug!("Platform signal source closed; relying on probe");
                            signals = None;
                        }
                    }
                }
            }
        }

        info!("Connectivity monitor stopped");
    }
}

async fn next_signal(signals: &mut Option<mpsc::Receiver<PlatformSignal>>) -> Option<PlatformSignal> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_common::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Probe whose answer can be flipped, optionally hanging forever.
    #[derive(Default)]
    struct ScriptedProbe {
        reachable: AtomicBool,
        hang: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn check(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::TransientRemote("connection refused".to_string()))
            }
        }
    }

    fn monitor(online: bool) -> (Arc<ConnectivityMonitor>, Arc<ScriptedProbe>, Arc<ManualClock>) {
        let probe = Arc::new(ScriptedProbe::default());
        probe.reachable.store(online, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::default());
        let monitor = Arc::new(ConnectivityMonitor::new(
            online,
            probe.clone(),
            clock.clone(),
            MonitorConfig::default(),
        ));
        (monitor, probe, clock)
    }

    #[tokio::test]
    async fn test_platform_signals_toggle_state() {
        let (monitor, _, _) = monitor(false);
        let mut events = monitor.subscribe();

        let event = monitor.handle_signal(PlatformSignal::Online).await.unwrap();
        assert!(event.online);
        assert_eq!(event.source, TransitionSource::Platform);
        assert!(monitor.is_online().await);
        assert_eq!(events.recv().await.unwrap(), event);

        assert!(monitor.handle_signal(PlatformSignal::Offline).await.is_some());
        assert!(!monitor.is_online().await);
    }

    #[tokio::test]
    async fn test_repeated_signal_is_noop() {
        let (monitor, _, _) = monitor(true);
        let mut events = monitor.subscribe();

        assert!(monitor.handle_signal(PlatformSignal::Online).await.is_none());
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_probe_corrects_platform_state() {
        let (monitor, probe, _) = monitor(true);

        probe.reachable.store(false, Ordering::SeqCst);
        let event = monitor.probe_once().await.unwrap();
        assert!(!event.online);
        assert_eq!(event.source, TransitionSource::Probe);

        probe.reachable.store(true, Ordering::SeqCst);
        assert!(monitor.probe_once().await.unwrap().online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_goes_offline() {
        let (monitor, probe, _) = monitor(true);
        probe.hang.store(true, Ordering::SeqCst);

        let event = monitor.probe_once().await.unwrap();

        assert!(!event.online);
        assert!(!monitor.is_online().await);
    }

    #[tokio::test]
    async fn test_offline_duration() {
        let (monitor, _, clock) = monitor(true);
        assert_eq!(monitor.snapshot().await.offline_duration, None);

        clock.advance(chrono::Duration::seconds(10));
        monitor.handle_signal(PlatformSignal::Offline).await;
        clock.advance(chrono::Duration::seconds(5));

        let snapshot = monitor.snapshot().await;
        assert!(!snapshot.is_online);
        // Measured from the last time the process was online.
        assert_eq!(snapshot.offline_duration, Some(Duration::from_secs(15)));

        let state = monitor.state().await;
        assert!(state.last_offline_at > state.last_online_at);
    }

    #[tokio::test]
    async fn test_offline_duration_when_never_online() {
        let (monitor, _, clock) = monitor(false);
        clock.advance(chrono::Duration::seconds(3));
        assert_eq!(
            monitor.snapshot().await.offline_duration,
            Some(Duration::from_secs(3))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_probes_periodically_and_stops() {
        let (monitor, probe, _) = monitor(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (signal_tx, signal_rx) = mpsc::channel(4);

        let task = tokio::spawn(monitor.clone().run(Some(signal_rx), shutdown_rx));

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        probe.reachable.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
        assert!(monitor.is_online().await);

        signal_tx.send(PlatformSignal::Offline).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.is_online().await);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
