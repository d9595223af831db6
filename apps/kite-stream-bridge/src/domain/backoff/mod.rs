//! Backoff Policy
//!
//! Exponential backoff with jitter, shared by the ticker's reconnect loop and
//! the retry loops of both downstream sinks.
//!
//! Delays never decrease across consecutive failures and never exceed the
//! cap: jitter is only ever added, and the result is clamped between the
//! previous delay and `max_delay`. The ticker additionally resets the policy
//! only after a connection stayed live longer than `stability_threshold`, so
//! a feed that flaps right after connecting keeps backing off.

use std::time::Duration;

use rand::Rng;

/// Configuration for backoff behavior.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound of any delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound of added jitter as a fraction of the base delay
    /// (e.g. 0.1 = up to +10%).
    pub jitter_factor: f64,
    /// Live period that must be exceeded before a disconnect starts from
    /// `initial_delay` again.
    pub stability_threshold: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            stability_threshold: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_factor: f64,
        stability_threshold: Duration,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter_factor,
            stability_threshold,
        }
    }

    /// Short retry curve for sink writes (store and queue).
    #[must_use]
    pub const fn sink_retry() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_factor: 0.1,
            stability_threshold: Duration::ZERO,
        }
    }

    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &crate::WebSocketSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            stability_threshold: settings.stability_threshold,
        }
    }
}

/// Backoff policy implementing exponential growth with additive jitter.
///
/// # Example
///
/// ```rust
/// use kite_stream_bridge::domain::backoff::{Backoff, BackoffConfig};
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(BackoffConfig::default());
///
/// let first = backoff.next_delay();
/// let second = backoff.next_delay();
/// assert!(second >= first);
///
/// // A long, healthy connection starts the curve over.
/// backoff.record_live_period(Duration::from_secs(60));
/// assert_eq!(backoff.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    base_delay: Duration,
    last_delay: Duration,
    attempt_count: u32,
}

impl Backoff {
    /// Create a new backoff policy.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            base_delay: initial_delay,
            last_delay: Duration::ZERO,
            attempt_count: 0,
        }
    }

    /// Next delay, then advance the curve.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt_count = self.attempt_count.saturating_add(1);

        let jittered = self.apply_jitter(self.base_delay).min(self.config.max_delay);
        let delay = jittered.max(self.last_delay);
        self.last_delay = delay;

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.base_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.base_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        delay
    }

    /// Report how long the last connection stayed live.
    ///
    /// Resets the curve only when the period exceeded the stability
    /// threshold. Returns whether a reset happened.
    pub fn record_live_period(&mut self, live_for: Duration) -> bool {
        if live_for > self.config.stability_threshold {
            self.reset();
            true
        } else {
            false
        }
    }

    /// Reset unconditionally (a sink write succeeded).
    pub const fn reset(&mut self) {
        self.base_delay = self.config.initial_delay;
        self.last_delay = Duration::ZERO;
        self.attempt_count = 0;
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// The configuration this policy runs with.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(0.0..=jitter_range);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted = (base_millis + jitter).max(1.0) as u64;
        Duration::from_millis(adjusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter(initial_ms: u64, max_ms: u64, multiplier: f64) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
            stability_threshold: Duration::from_secs(30),
        }
    }

    #[test]
    fn default_config_values() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!((config.jitter_factor - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.stability_threshold, Duration::from_secs(30));
    }

    #[test]
    fn exponential_growth() {
        let mut backoff = Backoff::new(no_jitter(100, 10_000, 2.0));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.attempt_count(), 4);
    }

    #[test]
    fn capped_at_max_delay() {
        let mut backoff = Backoff::new(no_jitter(1000, 2000, 4.0));

        let _ = backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
    }

    #[test]
    fn short_live_period_keeps_backing_off() {
        let mut backoff = Backoff::new(no_jitter(100, 10_000, 2.0));
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();

        assert!(!backoff.record_live_period(Duration::from_secs(5)));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
    }

    #[test]
    fn stable_live_period_resets() {
        let mut backoff = Backoff::new(no_jitter(100, 10_000, 2.0));
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();

        assert!(backoff.record_live_period(Duration::from_secs(31)));
        assert_eq!(backoff.attempt_count(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn live_period_at_threshold_does_not_reset() {
        let mut backoff = Backoff::new(no_jitter(100, 10_000, 2.0));
        let _ = backoff.next_delay();

        assert!(!backoff.record_live_period(Duration::from_secs(30)));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert!(backoff.record_live_period(Duration::from_millis(30_001)));
    }

    #[test]
    fn jitter_bounds() {
        for _ in 0..100 {
            let mut backoff = Backoff::new(BackoffConfig {
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter_factor: 0.1,
                stability_threshold: Duration::from_secs(30),
            });

            let millis = backoff.next_delay().as_millis();
            assert!(millis >= 1000, "delay {millis}ms is below minimum 1000ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    proptest! {
        #[test]
        fn delays_never_decrease_and_never_exceed_cap(
            initial_ms in 1u64..5_000,
            max_ms in 1u64..60_000,
            multiplier in 1.0f64..4.0,
            jitter in 0.0f64..0.5,
            attempts in 1usize..64,
        ) {
            let mut backoff = Backoff::new(BackoffConfig {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                multiplier,
                jitter_factor: jitter,
                stability_threshold: Duration::from_secs(30),
            });

            let mut previous = Duration::ZERO;
            for _ in 0..attempts {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(max_ms));
                previous = delay;
            }
        }
    }
}
