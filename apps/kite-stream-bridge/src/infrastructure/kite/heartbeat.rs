//! Heartbeat Monitor
//!
//! Tracks connection liveness. Kite pushes a one-byte heartbeat every second
//! when no ticks flow, so any frame at all proves the connection alive. The
//! monitor asks for a client ping every `ping_interval` and reports the
//! connection stale once nothing arrived for `stale_timeout`.
//!
//! Time is read from `tokio::time` so paused-clock tests drive it.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub stale_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(10),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, stale_timeout: Duration) -> Self {
        Self {
            ping_interval,
            stale_timeout,
        }
    }

    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &crate::WebSocketSettings) -> Self {
        Self {
            ping_interval: settings.ping_interval,
            stale_timeout: settings.stale_timeout,
        }
    }
}

/// Events emitted by the heartbeat monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Request to send a ping message.
    SendPing,
    /// No frame arrived within the stale timeout.
    Stale {
        /// Time since the last frame.
        silent_for: Duration,
    },
}

/// Per-connection liveness monitor.
///
/// Create one per session; `next_event` is cancel-safe and meant to be
/// polled from the session's `select!` loop.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    ping: Interval,
    last_frame: Instant,
}

impl HeartbeatMonitor {
    /// Start monitoring a freshly opened connection.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        let now = Instant::now();
        let mut ping = tokio::time::interval_at(now + config.ping_interval, config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            config,
            ping,
            last_frame: now,
        }
    }

    /// Record that a frame was received.
    pub fn record_frame(&mut self) {
        self.last_frame = Instant::now();
    }

    /// Time since the last frame.
    #[must_use]
    pub fn silent_for(&self) -> Duration {
        self.last_frame.elapsed()
    }

    /// Wait for the next ping slot or the stale deadline, whichever is first.
    pub async fn next_event(&mut self) -> HeartbeatEvent {
        let deadline = self.last_frame + self.config.stale_timeout;

        tokio::select! {
            biased;
            () = tokio::time::sleep_until(deadline) => {
                let silent_for = self.silent_for();
                tracing::warn!(
                    silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                    timeout_ms = u64::try_from(self.config.stale_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Heartbeat timeout detected"
                );
                HeartbeatEvent::Stale { silent_for }
            }
            _ = self.ping.tick() => HeartbeatEvent::SendPing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig::new(Duration::from_secs(5), Duration::from_secs(10))
    }

    #[test]
    fn default_config() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.stale_timeout, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn pings_on_interval() {
        let mut monitor = HeartbeatMonitor::new(config());

        let start = Instant::now();
        assert_eq!(monitor.next_event().await, HeartbeatEvent::SendPing);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_after_silence() {
        let mut monitor = HeartbeatMonitor::new(config());

        assert_eq!(monitor.next_event().await, HeartbeatEvent::SendPing);
        let event = monitor.next_event().await;
        assert!(matches!(event, HeartbeatEvent::Stale { silent_for } if silent_for >= Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_push_the_deadline() {
        let mut monitor = HeartbeatMonitor::new(config());

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(4)).await;
            monitor.record_frame();
        }

        assert!(monitor.silent_for() < Duration::from_secs(1));
        // Ping slots keep firing while frames flow; no staleness.
        assert_eq!(monitor.next_event().await, HeartbeatEvent::SendPing);
    }
}
