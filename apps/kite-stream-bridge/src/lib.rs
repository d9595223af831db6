#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Kite Stream Bridge - Market Data Ingestion Pipeline
//!
//! Keeps one authenticated connection to the Kite ticker WebSocket, decodes
//! the binary tick protocol and fans every tick out to two sinks: a
//! coalescing Redis state layer holding the latest tick per instrument, and
//! a batching dispatcher that hands ticks to Celery workers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Tick types and pure bookkeeping
//!   - `ticks`: Ticks, instrument tokens, modes, sequence stamping
//!   - `subscription`: Subscription registry and diffs
//!   - `backoff`: Reconnect and retry delays
//!
//! - **Application**: Port definitions and pipeline services
//!   - `ports`: Transport, token, state store and task queue interfaces
//!   - `services`: State sync, task dispatch, subscriptions, supervision
//!
//! - **Infrastructure**: Adapters and process plumbing
//!   - `kite`: Frame codec, heartbeat, ticker state machine, WebSocket
//!   - `broadcast`: Tick and control fan-out
//!   - `redis`: State store, Celery queue, control keys
//!   - `memory`: In-process sinks
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                                         ┌─────────────┐
//!                                     ┌──►│  StateSync  │──► Redis kt:state / kt:ltp
//! Kite WS ──► Ticker ──► BroadcastHub ─┤   └─────────────┘
//!                                     │   ┌─────────────┐
//!                                     └──►│ Dispatcher  │──► Celery queue (LPUSH)
//!                                         └─────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Tick types and subscription bookkeeping.
pub mod domain;

/// Application layer - Ports and pipeline services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::backoff::{Backoff, BackoffConfig};
pub use domain::subscription::{
    RegistryError, Subscription, SubscriptionDiff, SubscriptionRegistry,
};
pub use domain::ticks::{
    InstrumentToken, SequenceSource, Segment, SubscriptionMode, Tick, TickEvent,
};

// Ports
pub use application::ports::{
    AccessTokenProvider, DispatchBatch, FeedSession, FeedTransport, InboundFrame, OutboundFrame,
    QueueError, StateStore, StoreError, TaskQueue, TransportError,
};

// Services
pub use application::services::{
    HealthReport, HealthStatus, PipelineDeps, PipelineError, PipelineSupervisor, ShutdownReport,
    StateSync, SubmitOutcome, SubscriptionHandle, TaskDispatcher,
};

// Infrastructure config
pub use infrastructure::config::{
    BridgeConfig, BroadcastSettings, CelerySettings, ConfigError, Credentials, DispatchSettings,
    OverflowPolicy, ServerSettings, StateSyncSettings, SubscriptionSettings, WebSocketSettings,
};

// Ticker
pub use infrastructure::kite::{
    ConnectionSnapshot, ConnectionState, ControlMessage, FrameCodec, Ticker, TickerConfig,
    TickerError,
};

// Broadcast hub
pub use infrastructure::broadcast::{BroadcastHub, SharedBroadcastHub, TickReceiver};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
