//! Task Dispatcher
//!
//! Buffers tick events and hands them to the task queue in batches.
//!
//! # Flow
//!
//! ```text
//! hub ─► submit ─► bounded buffer ─► flusher ─► TaskQueue::enqueue
//!                       ▲                  │
//!                       └── requeue front ─┘ (on failure)
//! ```
//!
//! A batch flushes when `batch_size` events are buffered or `flush_interval`
//! elapses. Failed batches go back to the front of the buffer in order and
//! are retried with backoff. Delivery is at least once: a batch whose enqueue
//! timed out may still have reached the broker and will be sent again.
//!
//! The dispatcher reports degraded when enqueues keep failing, when the
//! buffer sits above its high-water mark, or when load shed events within
//! the last `RECENT_DROP_WINDOW`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{DispatchBatch, QueueError, TaskQueue};
use crate::domain::backoff::{Backoff, BackoffConfig};
use crate::domain::ticks::TickEvent;
use crate::infrastructure::broadcast::TickReceiver;
use crate::infrastructure::config::{DispatchSettings, OverflowPolicy};
use crate::infrastructure::metrics::{self, DropReason};

/// Depth, as a percentage of capacity, at which the buffer counts as saturated.
const HIGH_WATER_PERCENT: usize = 90;

/// How long an overflow drop keeps the dispatcher degraded.
const RECENT_DROP_WINDOW: Duration = Duration::from_secs(30);

/// What happened to a submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Buffered.
    Accepted,
    /// Buffered after evicting the oldest event.
    DroppedOldest,
    /// Buffer stayed full for the block timeout; the event was dropped.
    DroppedIncoming,
    /// Shutdown has begun; the event was dropped.
    Rejected,
}

/// Result of a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Events flushed during the drain.
    pub flushed: u64,
    /// Events still buffered when the grace period ended.
    pub discarded: u64,
}

/// Point-in-time dispatcher statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    /// Buffered events.
    pub depth: usize,
    /// Buffer bound.
    pub capacity: usize,
    /// Overflow policy name.
    pub overflow: &'static str,
    /// Events submitted.
    pub submitted: u64,
    /// Events handed to the queue.
    pub flushed: u64,
    /// Events dropped for any reason.
    pub dropped: u64,
    /// Batches handed to the queue.
    pub batches: u64,
    /// Failed enqueues.
    pub flush_failures: u64,
    /// Failed enqueues since the last success.
    pub consecutive_failures: u32,
    /// Depth at or above the high-water mark.
    pub saturated: bool,
    /// Events were shed under load within the recent window.
    pub dropping: bool,
    /// Failing beyond the configured bound, saturated or dropping.
    pub degraded: bool,
}

/// Batching, bounded forwarder to the task queue.
pub struct TaskDispatcher {
    queue: Arc<dyn TaskQueue>,
    settings: DispatchSettings,
    buffer: Mutex<VecDeque<Arc<TickEvent>>>,
    batch_ready: Notify,
    space_available: Notify,
    accepting: AtomicBool,
    submitted: AtomicU64,
    flushed: AtomicU64,
    dropped: AtomicU64,
    batches: AtomicU64,
    flush_failures: AtomicU64,
    consecutive_failures: AtomicU32,
    last_load_drop: Mutex<Option<Instant>>,
}

impl TaskDispatcher {
    /// Create a dispatcher over `queue`.
    #[must_use]
    pub fn new(queue: Arc<dyn TaskQueue>, settings: DispatchSettings) -> Self {
        Self {
            queue,
            buffer: Mutex::new(VecDeque::with_capacity(settings.capacity.min(65_536))),
            settings,
            batch_ready: Notify::new(),
            space_available: Notify::new(),
            accepting: AtomicBool::new(true),
            submitted: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_load_drop: Mutex::new(None),
        }
    }

    /// Buffer an event, applying the overflow policy when full.
    pub async fn submit(&self, event: Arc<TickEvent>) -> SubmitOutcome {
        if !self.accepting.load(Ordering::Acquire) {
            self.count_dropped(DropReason::Shutdown, 1);
            return SubmitOutcome::Rejected;
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);

        match self.settings.overflow {
            OverflowPolicy::DropOldest => {
                let evicted = {
                    let mut buffer = self.buffer.lock();
                    let evicted = if buffer.len() >= self.settings.capacity {
                        buffer.pop_front().is_some()
                    } else {
                        false
                    };
                    buffer.push_back(event);
                    self.after_push(buffer.len());
                    evicted
                };

                if evicted {
                    self.count_dropped(DropReason::Overflow, 1);
                    SubmitOutcome::DroppedOldest
                } else {
                    SubmitOutcome::Accepted
                }
            }
            OverflowPolicy::BlockWithTimeout(wait) => {
                let deadline = Instant::now() + wait;
                loop {
                    let room = self.space_available.notified();
                    {
                        let mut buffer = self.buffer.lock();
                        if buffer.len() < self.settings.capacity {
                            buffer.push_back(event);
                            self.after_push(buffer.len());
                            return SubmitOutcome::Accepted;
                        }
                    }
                    if tokio::time::timeout_at(deadline, room).await.is_err() {
                        self.count_dropped(DropReason::BlockTimeout, 1);
                        return SubmitOutcome::DroppedIncoming;
                    }
                }
            }
        }
    }

    fn after_push(&self, depth: usize) {
        metrics::set_dispatch_depth(depth);
        if depth >= self.settings.batch_size {
            self.batch_ready.notify_one();
        }
    }

    /// Send one batch from the front of the buffer.
    ///
    /// Returns the number of events flushed (0 if the buffer was empty).
    ///
    /// # Errors
    ///
    /// Returns the queue error after putting the batch back at the front.
    pub async fn flush_once(&self) -> Result<usize, QueueError> {
        let events: Vec<Arc<TickEvent>> = {
            let mut buffer = self.buffer.lock();
            let take = buffer.len().min(self.settings.batch_size);
            buffer.drain(..take).collect()
        };
        if events.is_empty() {
            return Ok(0);
        }

        let batch = DispatchBatch::new(events);
        let started = Instant::now();
        let result = tokio::time::timeout(self.settings.flush_timeout, self.queue.enqueue(&batch))
            .await
            .unwrap_or(Err(QueueError::Timeout));
        metrics::record_dispatch_flush_duration(started.elapsed());

        match result {
            Ok(()) => {
                let count = batch.len();
                self.flushed.fetch_add(count as u64, Ordering::Relaxed);
                self.batches.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                metrics::record_dispatch_flushed(count as u64);
                metrics::set_dispatch_depth(self.depth());
                self.space_available.notify_one();
                tracing::trace!(batch_id = %batch.batch_id, events = count, "Batch enqueued");
                Ok(count)
            }
            Err(e) => {
                self.flush_failures.fetch_add(1, Ordering::Relaxed);
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::record_dispatch_flush_failure();
                tracing::warn!(
                    batch_id = %batch.batch_id,
                    events = batch.len(),
                    failures,
                    error = %e,
                    "Enqueue failed, batch requeued"
                );
                if failures == self.settings.degraded_after_failures {
                    tracing::error!(failures, "Task dispatcher degraded");
                }
                self.requeue(batch);
                Err(e)
            }
        }
    }

    fn requeue(&self, batch: DispatchBatch) {
        let overflow = {
            let mut buffer = self.buffer.lock();
            for event in batch.events.into_iter().rev() {
                buffer.push_front(event);
            }

            let excess = buffer.len().saturating_sub(self.settings.capacity);
            match self.settings.overflow {
                OverflowPolicy::DropOldest => drop(buffer.drain(..excess)),
                OverflowPolicy::BlockWithTimeout(_) => {
                    let keep = buffer.len() - excess;
                    buffer.truncate(keep);
                }
            }
            metrics::set_dispatch_depth(buffer.len());
            excess
        };

        if overflow > 0 {
            self.count_dropped(DropReason::Overflow, overflow as u64);
        }
    }

    /// Stop accepting events. Later submits are rejected and counted.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Flush until the buffer is empty or `grace` has elapsed.
    ///
    /// Whatever is left is discarded and counted.
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        self.close();
        let deadline = Instant::now() + grace;
        let mut backoff = Backoff::new(BackoffConfig::sink_retry());
        let mut report = DrainReport::default();

        while self.depth() > 0 && Instant::now() < deadline {
            // Bounded by the flush timeout; a failed batch is requeued first.
            match self.flush_once().await {
                Ok(count) => report.flushed += count as u64,
                Err(_) => {
                    let wake = (Instant::now() + backoff.next_delay()).min(deadline);
                    tokio::time::sleep_until(wake).await;
                }
            }
        }

        let remaining = {
            let mut buffer = self.buffer.lock();
            let remaining = buffer.len();
            buffer.clear();
            remaining
        };
        report.discarded = remaining as u64;
        if remaining > 0 {
            self.count_dropped(DropReason::DrainExpired, report.discarded);
            tracing::warn!(discarded = remaining, "Drain grace period expired");
        }
        metrics::set_dispatch_depth(0);

        tracing::info!(flushed = report.flushed, discarded = report.discarded, "Dispatcher drained");
        report
    }

    /// Submit hub events until cancelled, then submit what is still buffered.
    pub async fn run_intake(self: Arc<Self>, mut rx: TickReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        self.submit(event).await;
                    }
                    None => break,
                },
            }
        }

        let mut drained = 0u64;
        while let Some(event) = rx.try_recv() {
            self.submit(event).await;
            drained += 1;
        }
        tracing::debug!(drained, "Dispatcher intake stopped");
    }

    /// Flush on size or interval until cancelled; failures back off.
    pub async fn run_flusher(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(BackoffConfig::sink_retry());
        let mut interval = tokio::time::interval(self.settings.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.batch_ready.notified() => {}
                _ = interval.tick() => {}
            }

            loop {
                match self.flush_once().await {
                    Ok(count) => {
                        backoff.reset();
                        if count < self.settings.batch_size || self.depth() < self.settings.batch_size {
                            break;
                        }
                    }
                    Err(_) => {
                        let delay = backoff.next_delay();
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(delay) => {}
                        }
                        break;
                    }
                }
            }
        }

        tracing::debug!("Dispatcher flusher stopped");
    }

    /// Buffered events.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed);
        let depth = self.depth();
        let failing = consecutive_failures >= self.settings.degraded_after_failures;
        let saturated = depth * 100 >= self.settings.capacity * HIGH_WATER_PERCENT;
        let dropping = self
            .last_load_drop
            .lock()
            .is_some_and(|at| at.elapsed() < RECENT_DROP_WINDOW);
        DispatcherStats {
            depth,
            capacity: self.settings.capacity,
            overflow: self.settings.overflow.as_str(),
            submitted: self.submitted.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            consecutive_failures,
            saturated,
            dropping,
            degraded: failing || saturated || dropping,
        }
    }

    fn count_dropped(&self, reason: DropReason, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
        if matches!(reason, DropReason::Overflow | DropReason::BlockTimeout) {
            *self.last_load_drop.lock() = Some(Instant::now());
        }
        metrics::record_dispatch_dropped(reason, count);
    }
}

// =============================================================================
// Tests
// =============================================================================
