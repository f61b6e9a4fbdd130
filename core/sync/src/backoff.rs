//! Exponential backoff between drain passes.
//!
//! Entries are never retried inside a pass. When a pass leaves retried
//! entries behind, the scheduler waits `delay_for_attempt(n)` before the
//! next one, where `n` counts consecutive passes that ended that way.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for backoff behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first pass with failures.
    pub initial_delay_ms: u64,
    /// Maximum delay (cap for exponential growth).
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Backoff starting at `initial_delay`, other knobs at their defaults.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay_ms: initial_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Spread delays by a random factor in `[0.75, 1.25]`.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before pass `attempt + 1`, where attempt 0 is the first wait.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let grown = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let mut millis = grown.min(self.max_delay_ms as f64);

        if self.jitter {
            millis *= rand::random_range(0.75..=1.25);
        }

        Duration::from_millis(millis as u64)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Tracks consecutive drain passes that ended with retried entries.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    consecutive: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            consecutive: 0,
        }
    }

    /// Record a pass that left retried entries and return how long to wait
    /// before the next one.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.config.delay_for_attempt(self.consecutive);
        self.consecutive = self.consecutive.saturating_add(1);
        delay
    }

    /// Record a clean pass (or a connectivity change).
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Number of consecutive passes with retries.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        let config = BackoffConfig::new(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = BackoffConfig::new(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = BackoffConfig::new(Duration::from_secs(4));
        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_secs(3));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut backoff = Backoff::new(
            BackoffConfig::new(Duration::from_millis(100)).with_jitter(false),
        );

        assert_eq!(backoff.record_failure(), Duration::from_millis(100));
        assert_eq!(backoff.record_failure(), Duration::from_millis(200));
        assert_eq!(backoff.consecutive_failures(), 2);

        backoff.reset();
        assert_eq!(backoff.record_failure(), Duration::from_millis(100));
    }
}
