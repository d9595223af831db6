//! In-Memory Adapters
//!
//! Process-local implementations of the `StateStore` and `TaskQueue` ports.
//! Used by tests and for running the bridge without Redis; both can be told
//! to fail so the retry paths can be exercised.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::application::ports::{
    DispatchBatch, QueueError, StateStore, StoreError, TaskQueue,
};
use crate::domain::ticks::{InstrumentToken, TickEvent};

// =============================================================================
// State store
// =============================================================================

/// State store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: Mutex<HashMap<InstrumentToken, TickEvent>>,
    upserts: AtomicU64,
    failing: AtomicBool,
}

impl InMemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful upserts since creation.
    #[must_use]
    pub fn upserts(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Number of stored instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn check_failing(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn upsert(&self, event: &TickEvent) -> Result<(), StoreError> {
        self.check_failing()?;
        self.entries.lock().insert(event.token(), event.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, token: InstrumentToken) -> Result<Option<TickEvent>, StoreError> {
        self.check_failing()?;
        Ok(self.entries.lock().get(&token).cloned())
    }

    async fn remove(&self, token: InstrumentToken) -> Result<(), StoreError> {
        self.check_failing()?;
        self.entries.lock().remove(&token);
        Ok(())
    }

    async fn check(&self) -> Result<(), StoreError> {
        self.check_failing()
    }
}

// =============================================================================
// Task queue
// =============================================================================

/// Task queue that records every accepted batch.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    batches: Mutex<Vec<DispatchBatch>>,
    failing: AtomicBool,
    fail_next: AtomicU32,
    attempts: AtomicU64,
}

impl InMemoryTaskQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every enqueue fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `count` enqueues.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Accepted batches in enqueue order.
    #[must_use]
    pub fn batches(&self) -> Vec<DispatchBatch> {
        self.batches.lock().clone()
    }

    /// Sequence numbers of all accepted events in enqueue order.
    #[must_use]
    pub fn sequences(&self) -> Vec<u64> {
        self.batches
            .lock()
            .iter()
            .flat_map(|batch| batch.events.iter().map(|event| event.sequence))
            .collect()
    }

    /// Enqueue attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, batch: &DispatchBatch) -> Result<(), QueueError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("in-memory queue set to fail".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(QueueError::Unavailable("injected failure".into()));
        }

        self.batches.lock().push(batch.clone());
        Ok(())
    }

    async fn check(&self) -> Result<(), QueueError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("in-memory queue set to fail".into()));
        }
        Ok(())
    }
}

/// Shared in-memory adapters, as handed to the pipeline.
#[must_use]
pub fn in_memory_sinks() -> (Arc<InMemoryStateStore>, Arc<InMemoryTaskQueue>) {
    (
        Arc::new(InMemoryStateStore::new()),
        Arc::new(InMemoryTaskQueue::new()),
    )
}
