//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedTransport` / `FeedSession`: the ticker WebSocket
//! - `AccessTokenProvider`: source of the session access token
//! - `StateStore`: shared low-latency tick state (Redis)
//! - `TaskQueue`: asynchronous processing pipeline (Celery)

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::domain::ticks::{InstrumentToken, TickEvent};

// =============================================================================
// Feed transport
// =============================================================================

/// Frame sent to the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// JSON command.
    Text(String),
    /// Keepalive ping.
    Ping,
}

/// Frame received from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Binary tick frame (or one-byte heartbeat).
    Binary(Bytes),
    /// JSON control message.
    Text(String),
    /// Any frame that carries no payload for the codec (ping/pong).
    Keepalive,
    /// Peer closed the connection.
    Close,
}

/// Transport-level failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Upgrade rejected because the credentials are not accepted.
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    /// Connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Established connection failed.
    #[error("connection error: {0}")]
    Io(String),
}

/// An open connection to the feed.
#[async_trait]
pub trait FeedSession: Send {
    /// Send a frame.
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Receive the next frame; `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>>;

    /// Close the connection.
    async fn close(&mut self);
}

/// Opens feed sessions.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Connect to `url` (which already carries the credentials).
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedSession>, TransportError>;
}

/// Source of the access token used to open a session.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// API key of the application.
    fn api_key(&self) -> &str;

    /// Current access token.
    async fn access_token(&self) -> Result<String, TransportError>;
}

// =============================================================================
// State store
// =============================================================================

/// State store failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Store could not be reached.
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    /// Stored value could not be (de)serialized.
    #[error("state store encoding error: {0}")]
    Encoding(String),
}

/// Client contract of the shared state store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Write the latest event of an instrument.
    async fn upsert(&self, event: &TickEvent) -> Result<(), StoreError>;

    /// Read the stored event of an instrument.
    async fn read(&self, token: InstrumentToken) -> Result<Option<TickEvent>, StoreError>;

    /// Delete the stored event of an instrument.
    async fn remove(&self, token: InstrumentToken) -> Result<(), StoreError>;

    /// Reachability probe.
    async fn check(&self) -> Result<(), StoreError>;
}

// =============================================================================
// Task queue
// =============================================================================

/// Ordered events handed to the task queue in one message.
#[derive(Debug, Clone)]
pub struct DispatchBatch {
    /// Unique batch id (also the task id).
    pub batch_id: Uuid,
    /// Events in receipt order.
    pub events: Vec<Arc<TickEvent>>,
}

impl DispatchBatch {
    /// Create a batch with a fresh id.
    #[must_use]
    pub fn new(events: Vec<Arc<TickEvent>>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            events,
        }
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Task queue failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// Broker could not be reached.
    #[error("task queue unavailable: {0}")]
    Unavailable(String),
    /// Message could not be built.
    #[error("task message encoding error: {0}")]
    Encoding(String),
    /// Enqueue did not finish within the flush timeout.
    #[error("enqueue timed out")]
    Timeout,
}

/// Enqueue contract of the task queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Hand a batch to the queue. Ownership of the message moves to the broker.
    async fn enqueue(&self, batch: &DispatchBatch) -> Result<(), QueueError>;

    /// Reachability probe.
    async fn check(&self) -> Result<(), QueueError>;
}
