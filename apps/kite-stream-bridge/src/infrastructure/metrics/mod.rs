//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Feed**: ticks and control messages received, malformed frames
//! - **Connection**: state transitions, reconnects, current state
//! - **State sync**: store writes, failures, stale drops, write lag
//! - **Dispatch**: buffer depth, flushed and dropped events, flush latency
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! without an installed recorder is a no-op, so tests need no setup.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Idempotent: later calls return the handle installed by the first.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Feed
    describe_counter!(
        "kite_bridge_ticks_received_total",
        "Total ticks decoded from the Kite feed"
    );
    describe_counter!(
        "kite_bridge_control_messages_total",
        "Total control messages received from the Kite feed"
    );
    describe_counter!(
        "kite_bridge_malformed_frames_total",
        "Total frames skipped because they could not be decoded"
    );
    describe_counter!(
        "kite_bridge_hub_lagged_total",
        "Total events missed by lagging hub consumers"
    );

    // Connection
    describe_counter!(
        "kite_bridge_state_transitions_total",
        "Total ticker state transitions"
    );
    describe_counter!(
        "kite_bridge_reconnects_total",
        "Total ticker reconnections by reason"
    );
    describe_gauge!(
        "kite_bridge_connection_state",
        "Current ticker state (0=disconnected .. 6=closing)"
    );
    describe_gauge!(
        "kite_bridge_subscriptions",
        "Number of instruments in the subscription registry"
    );

    // State sync
    describe_counter!(
        "kite_bridge_state_writes_total",
        "Total state store writes"
    );
    describe_counter!(
        "kite_bridge_state_write_failures_total",
        "Total failed state store writes"
    );
    describe_counter!(
        "kite_bridge_state_stale_dropped_total",
        "Total events dropped because a newer event was already applied"
    );
    describe_gauge!(
        "kite_bridge_state_write_lag_seconds",
        "Age of the oldest unflushed state update"
    );

    // Dispatch
    describe_gauge!(
        "kite_bridge_dispatch_depth",
        "Events buffered in the task dispatcher"
    );
    describe_counter!(
        "kite_bridge_dispatch_flushed_total",
        "Total events handed to the task queue"
    );
    describe_counter!(
        "kite_bridge_dispatch_dropped_total",
        "Total events dropped by the task dispatcher by reason"
    );
    describe_counter!(
        "kite_bridge_dispatch_flush_failures_total",
        "Total failed task queue flushes"
    );
    describe_histogram!(
        "kite_bridge_dispatch_flush_seconds",
        "Task queue enqueue latency"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reasons the dispatcher drops events.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// Buffer full, oldest event evicted.
    Overflow,
    /// Buffer stayed full for the block timeout.
    BlockTimeout,
    /// Submitted after shutdown began.
    Shutdown,
    /// Still buffered when the drain grace period ended.
    DrainExpired,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Overflow => "overflow",
            Self::BlockTimeout => "block_timeout",
            Self::Shutdown => "shutdown",
            Self::DrainExpired => "drain_expired",
        }
    }
}

/// Record ticks decoded from one frame.
pub fn record_ticks_received(count: u64) {
    counter!("kite_bridge_ticks_received_total").increment(count);
}

/// Record a control message.
pub fn record_control_message(kind: &'static str) {
    counter!("kite_bridge_control_messages_total", "kind" => kind).increment(1);
}

/// Record a frame that failed to decode.
pub fn record_malformed_frame() {
    counter!("kite_bridge_malformed_frames_total").increment(1);
}

/// Record events a hub consumer missed.
pub fn record_hub_lagged(consumer: &'static str, count: u64) {
    counter!("kite_bridge_hub_lagged_total", "consumer" => consumer).increment(count);
}

/// Record a ticker state transition.
pub fn record_state_transition(state: &'static str, ordinal: u8) {
    counter!("kite_bridge_state_transitions_total", "state" => state).increment(1);
    gauge!("kite_bridge_connection_state").set(f64::from(ordinal));
}

/// Record a reconnect.
pub fn record_reconnect(reason: &'static str) {
    counter!("kite_bridge_reconnects_total", "reason" => reason).increment(1);
}

/// Update the registry size.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("kite_bridge_subscriptions").set(count as f64);
}

/// Record state store writes.
pub fn record_state_writes(count: u64) {
    counter!("kite_bridge_state_writes_total").increment(count);
}

/// Record a failed state store write.
pub fn record_state_write_failure() {
    counter!("kite_bridge_state_write_failures_total").increment(1);
}

/// Record an out-of-order event dropped by state sync.
pub fn record_state_stale_dropped() {
    counter!("kite_bridge_state_stale_dropped_total").increment(1);
}

/// Update the state write lag.
pub fn set_state_write_lag(lag: Duration) {
    gauge!("kite_bridge_state_write_lag_seconds").set(lag.as_secs_f64());
}

/// Update the dispatcher buffer depth.
#[allow(clippy::cast_precision_loss)]
pub fn set_dispatch_depth(depth: usize) {
    gauge!("kite_bridge_dispatch_depth").set(depth as f64);
}

/// Record events handed to the task queue.
pub fn record_dispatch_flushed(count: u64) {
    counter!("kite_bridge_dispatch_flushed_total").increment(count);
}

/// Record events dropped by the dispatcher.
pub fn record_dispatch_dropped(reason: DropReason, count: u64) {
    counter!("kite_bridge_dispatch_dropped_total", "reason" => reason.as_str()).increment(count);
}

/// Record a failed flush.
pub fn record_dispatch_flush_failure() {
    counter!("kite_bridge_dispatch_flush_failures_total").increment(1);
}

/// Record enqueue latency.
pub fn record_dispatch_flush_duration(duration: Duration) {
    histogram!("kite_bridge_dispatch_flush_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::Overflow.as_str(), "overflow");
        assert_eq!(DropReason::BlockTimeout.as_str(), "block_timeout");
        assert_eq!(DropReason::Shutdown.as_str(), "shutdown");
        assert_eq!(DropReason::DrainExpired.as_str(), "drain_expired");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_ticks_received(3);
        record_malformed_frame();
        record_state_transition("live", 4);
        set_dispatch_depth(10);
        record_dispatch_dropped(DropReason::Overflow, 1);
    }
}
