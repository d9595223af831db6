//! Broadcast Hub
//!
//! Fans decoded feed messages out to the pipeline consumers using tokio
//! broadcast channels.
//!
//! # Architecture
//!
//! The `BroadcastHub` provides two channels:
//! - Ticks (`Arc<TickEvent>`), consumed independently by state sync and the
//!   task dispatcher
//! - Control messages (order updates, server errors and notices)
//!
//! Each receiver keeps its own cursor, so a slow consumer never stalls the
//! ticker or the other consumer. A receiver that falls more than the channel
//! capacity behind loses the oldest events; the loss is counted per consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::domain::ticks::TickEvent;
use crate::infrastructure::config::BroadcastSettings;
use crate::infrastructure::kite::ControlMessage;
use crate::infrastructure::metrics;

// =============================================================================
// Broadcast Hub
// =============================================================================

/// Central hub for the tick and control channels.
///
/// # Example
///
/// ```rust
/// use kite_stream_bridge::infrastructure::broadcast::BroadcastHub;
///
/// let hub = BroadcastHub::with_defaults();
///
/// // Consumers subscribe before the ticker starts publishing
/// let mut ticks = hub.ticks_rx("state_sync");
/// assert_eq!(hub.tick_receiver_count(), 1);
/// ```
#[derive(Debug)]
pub struct BroadcastHub {
    ticks_tx: broadcast::Sender<Arc<TickEvent>>,
    control_tx: broadcast::Sender<ControlMessage>,
    lagged: Arc<AtomicU64>,
}

impl BroadcastHub {
    /// Create a new broadcast hub with the given settings.
    #[must_use]
    pub fn new(settings: &BroadcastSettings) -> Self {
        Self {
            ticks_tx: broadcast::channel(settings.hub_capacity.max(1)).0,
            control_tx: broadcast::channel(settings.control_capacity.max(1)).0,
            lagged: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a new broadcast hub with default settings.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(&BroadcastSettings::default())
    }

    /// Publish a tick to all consumers.
    ///
    /// Returns the number of receivers, or `None` if there are none.
    pub fn publish_tick(&self, event: Arc<TickEvent>) -> Option<usize> {
        self.ticks_tx.send(event).ok()
    }

    /// Publish a control message.
    pub fn publish_control(&self, message: ControlMessage) -> Option<usize> {
        self.control_tx.send(message).ok()
    }

    /// Get a new tick receiver for a named consumer.
    #[must_use]
    pub fn ticks_rx(&self, consumer: &'static str) -> TickReceiver {
        TickReceiver {
            inner: self.ticks_tx.subscribe(),
            consumer,
            lagged: Arc::clone(&self.lagged),
        }
    }

    /// Get a new control message receiver.
    #[must_use]
    pub fn control_rx(&self) -> broadcast::Receiver<ControlMessage> {
        self.control_tx.subscribe()
    }

    /// Number of active tick receivers.
    #[must_use]
    pub fn tick_receiver_count(&self) -> usize {
        self.ticks_tx.receiver_count()
    }

    /// Events missed by lagging tick receivers since start.
    #[must_use]
    pub fn lagged_total(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }
}

/// Shared broadcast hub reference.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

/// Tick receiver that counts lag instead of surfacing it.
#[derive(Debug)]
pub struct TickReceiver {
    inner: broadcast::Receiver<Arc<TickEvent>>,
    consumer: &'static str,
    lagged: Arc<AtomicU64>,
}

impl TickReceiver {
    /// Wait for the next event; `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Arc<TickEvent>> {
        loop {
            match self.inner.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => self.record_lag(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<TickEvent>> {
        loop {
            match self.inner.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(missed)) => self.record_lag(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&self, missed: u64) {
        tracing::warn!(consumer = self.consumer, missed, "Hub consumer lagged, events lost");
        self.lagged.fetch_add(missed, Ordering::Relaxed);
        metrics::record_hub_lagged(self.consumer, missed);
    }
}

// =============================================================================
// Tests
// =============================================================================
