//! State Sync
//!
//! Keeps the latest event of every instrument in memory and writes it through
//! to the shared state store.
//!
//! Rapid updates coalesce: only the event with the highest sequence number
//! survives, and the flusher writes each dirty instrument at most once per
//! flush interval. Failed writes leave the entry dirty, so the next attempt
//! always carries the newest value.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{StateStore, StoreError};
use crate::domain::backoff::{Backoff, BackoffConfig};
use crate::domain::ticks::{InstrumentToken, TickEvent};
use crate::infrastructure::broadcast::TickReceiver;
use crate::infrastructure::config::StateSyncSettings;
use crate::infrastructure::metrics;

/// State sync errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateSyncError {
    /// No event has been applied for the instrument.
    #[error("no state for instrument {0}")]
    NotFound(InstrumentToken),

    /// Store write failed; the entry stays dirty.
    #[error("state store write failed: {0}")]
    StoreWrite(#[source] StoreError),
}

/// Latest event of one instrument.
#[derive(Debug, Clone)]
pub struct CoalescedState {
    /// Event with the highest sequence seen.
    pub event: Arc<TickEvent>,
    /// Not yet written to the store.
    pub dirty: bool,
    /// Time of the last successful write.
    pub last_flush: Option<DateTime<Utc>>,
    dirty_since: Option<Instant>,
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Entries written.
    pub written: u64,
    /// Entries whose write failed.
    pub failed: u64,
}

/// Point-in-time state sync statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StateSyncStats {
    /// Instruments with state.
    pub tracked: usize,
    /// Instruments waiting for a write.
    pub dirty: usize,
    /// Events dropped because a newer one was already applied.
    pub stale_dropped: u64,
    /// Successful store writes.
    pub writes: u64,
    /// Failed store writes.
    pub write_failures: u64,
    /// Flush passes in a row with at least one failure.
    pub consecutive_failures: u32,
    /// Age of the oldest unflushed update, in milliseconds.
    pub write_lag_ms: u64,
    /// Lag or failures beyond the configured bounds.
    pub degraded: bool,
}

/// Coalescing write-through cache in front of the state store.
pub struct StateSync {
    store: Arc<dyn StateStore>,
    settings: StateSyncSettings,
    entries: Mutex<HashMap<InstrumentToken, CoalescedState>>,
    // Serialises flushes against removals so a removed entry is never rewritten.
    flush_lock: tokio::sync::Mutex<()>,
    stale_dropped: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl StateSync {
    /// Create a state sync over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, settings: StateSyncSettings) -> Self {
        Self {
            store,
            settings,
            entries: Mutex::new(HashMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            stale_dropped: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Apply an event. Returns `false` if a newer event was already applied.
    pub fn apply(&self, event: Arc<TickEvent>) -> bool {
        let mut entries = self.entries.lock();
        let token = event.token();

        match entries.get_mut(&token) {
            Some(state) if state.event.sequence >= event.sequence => {
                drop(entries);
                self.stale_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_state_stale_dropped();
                false
            }
            Some(state) => {
                state.event = event;
                if !state.dirty {
                    state.dirty = true;
                    state.dirty_since = Some(Instant::now());
                }
                true
            }
            None => {
                entries.insert(
                    token,
                    CoalescedState {
                        event,
                        dirty: true,
                        last_flush: None,
                        dirty_since: Some(Instant::now()),
                    },
                );
                true
            }
        }
    }

    /// Last-known state of an instrument.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing has been applied for `token`.
    pub fn read(&self, token: InstrumentToken) -> Result<CoalescedState, StateSyncError> {
        self.entries
            .lock()
            .get(&token)
            .cloned()
            .ok_or(StateSyncError::NotFound(token))
    }

    /// Discard the state of an unsubscribed instrument, locally and in the store.
    ///
    /// # Errors
    ///
    /// Returns `StoreWrite` if the store delete fails. Local state is gone
    /// either way.
    pub async fn remove(&self, token: InstrumentToken) -> Result<(), StateSyncError> {
        let _guard = self.flush_lock.lock().await;
        self.entries.lock().remove(&token);
        self.store
            .remove(token)
            .await
            .map_err(StateSyncError::StoreWrite)
    }

    /// Write every dirty entry once.
    pub async fn flush(&self) -> FlushOutcome {
        let _guard = self.flush_lock.lock().await;

        let pending: Vec<Arc<TickEvent>> = self
            .entries
            .lock()
            .values()
            .filter(|state| state.dirty)
            .map(|state| Arc::clone(&state.event))
            .collect();

        let mut outcome = FlushOutcome::default();
        for event in pending {
            match self.store.upsert(&event).await {
                Ok(()) => {
                    outcome.written += 1;
                    let mut entries = self.entries.lock();
                    if let Some(state) = entries.get_mut(&event.token()) {
                        state.last_flush = Some(Utc::now());
                        // A newer event arrived during the write: stay dirty.
                        if state.event.sequence == event.sequence {
                            state.dirty = false;
                            state.dirty_since = None;
                        }
                    }
                }
                Err(e) => {
                    outcome.failed += 1;
                    metrics::record_state_write_failure();
                    tracing::warn!(
                        token = %event.token(),
                        error = %StateSyncError::StoreWrite(e),
                        "State write failed, entry stays dirty"
                    );
                }
            }
        }

        self.writes.fetch_add(outcome.written, Ordering::Relaxed);
        self.write_failures
            .fetch_add(outcome.failed, Ordering::Relaxed);
        if outcome.failed > 0 {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
        if outcome.written > 0 {
            metrics::record_state_writes(outcome.written);
        }
        metrics::set_state_write_lag(self.write_lag());

        outcome
    }

    /// Age of the oldest unflushed update.
    #[must_use]
    pub fn write_lag(&self) -> Duration {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter_map(|state| state.dirty_since)
            .map(|since| now.saturating_duration_since(since))
            .max()
            .unwrap_or_default()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> StateSyncStats {
        let (tracked, dirty) = {
            let entries = self.entries.lock();
            (entries.len(), entries.values().filter(|s| s.dirty).count())
        };
        let write_lag = self.write_lag();
        let consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed);

        StateSyncStats {
            tracked,
            dirty,
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            consecutive_failures,
            write_lag_ms: u64::try_from(write_lag.as_millis()).unwrap_or(u64::MAX),
            degraded: consecutive_failures > 0 || write_lag > self.settings.lag_degraded,
        }
    }

    /// Apply hub events until cancelled, then apply what is still buffered.
    pub async fn run_intake(self: Arc<Self>, mut rx: TickReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        self.apply(event);
                    }
                    None => break,
                },
            }
        }

        let mut drained = 0u64;
        while let Some(event) = rx.try_recv() {
            self.apply(event);
            drained += 1;
        }
        tracing::debug!(drained, "State sync intake stopped");
    }

    /// Flush on every interval until cancelled; failed passes back off.
    pub async fn run_flusher(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(BackoffConfig::sink_retry());
        let mut interval = tokio::time::interval(self.settings.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let outcome = self.flush().await;
            if outcome.failed == 0 {
                backoff.reset();
                continue;
            }

            let delay = backoff.next_delay();
            tracing::debug!(
                failed = outcome.failed,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Backing off state writes"
            );
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!("State sync flusher stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
