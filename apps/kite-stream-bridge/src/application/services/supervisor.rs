//! Pipeline Supervisor
//!
//! Wires the ticker, the broadcast hub and both sinks together and owns
//! their lifecycle.
//!
//! # Start order
//!
//! 1. Validate configuration, probe the state store and the task queue
//! 2. Seed the registry with the default instruments
//! 3. Subscribe the consumers to the hub and spawn their tasks
//! 4. Spawn the ticker
//!
//! # Stop order
//!
//! The reverse: stop the ticker, let both intakes drain what the hub still
//! buffers, drain the dispatcher within the grace period, then run a final
//! state flush.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatcher::{DispatcherStats, DrainReport, TaskDispatcher};
use super::state_sync::{StateSync, StateSyncStats};
use super::subscriptions::SubscriptionHandle;
use crate::application::ports::{
    AccessTokenProvider, FeedTransport, QueueError, StateStore, StoreError, TaskQueue,
};
use crate::domain::subscription::{RegistryError, Subscription, SubscriptionRegistry};
use crate::domain::ticks::SequenceSource;
use crate::infrastructure::broadcast::{BroadcastHub, SharedBroadcastHub};
use crate::infrastructure::config::{BridgeConfig, ConfigError};
use crate::infrastructure::kite::{
    ConnectionSnapshot, ConnectionState, Ticker, TickerConfig,
};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Pipeline lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// State store unreachable at start.
    #[error("state store unreachable: {0}")]
    StoreUnreachable(#[source] StoreError),

    /// Task queue unreachable at start.
    #[error("task queue unreachable: {0}")]
    QueueUnreachable(#[source] QueueError),

    /// Default instruments do not fit the registry.
    #[error("cannot seed registry: {0}")]
    Seed(#[from] RegistryError),

    /// Stop called twice.
    #[error("pipeline is not running")]
    NotRunning,
}

// =============================================================================
// Health
// =============================================================================

/// Aggregate health, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Streaming, both sinks keeping up.
    Live,
    /// Connection is being (re)established.
    Reconnecting,
    /// Authentication failing or a sink lagging or failing.
    Degraded,
    /// Shut down.
    Stopped,
}

/// Health report of the whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst status of all components.
    pub status: HealthStatus,
    /// Service version.
    pub version: &'static str,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Report time.
    pub current_time: DateTime<Utc>,
    /// Ticker connection.
    pub connection: ConnectionSnapshot,
    /// Last sequence number handed out.
    pub last_sequence: u64,
    /// Subscribed instruments.
    pub subscriptions: usize,
    /// Events lost by lagging hub consumers.
    pub hub_lagged: u64,
    /// State sync.
    pub state_sync: StateSyncStats,
    /// Task dispatcher.
    pub dispatcher: DispatcherStats,
}

impl HealthReport {
    /// Ready to serve when the connection is LIVE.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.connection.state == ConnectionState::Live && self.status != HealthStatus::Stopped
    }
}

/// Final counts after stop.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Ticks stamped since start.
    pub ticks_received: u64,
    /// Ticker reconnects since start.
    pub reconnects: u64,
    /// Events handed to the task queue since start.
    pub dispatched: u64,
    /// Events dropped by the dispatcher since start, drain discards included.
    pub dispatch_dropped: u64,
    /// Outcome of the dispatcher drain.
    pub drain: DrainReport,
    /// State writes since start.
    pub state_writes: u64,
    /// Instruments whose latest state was not written.
    pub state_unflushed: usize,
    /// Events lost by lagging hub consumers.
    pub hub_lagged: u64,
    /// Time the stop took.
    pub stop_duration_ms: u64,
}

/// Adapters the pipeline runs on.
#[derive(Clone)]
pub struct PipelineDeps {
    /// Ticker transport.
    pub transport: Arc<dyn FeedTransport>,
    /// Access token source.
    pub tokens: Arc<dyn AccessTokenProvider>,
    /// Shared state store.
    pub store: Arc<dyn StateStore>,
    /// Task queue.
    pub queue: Arc<dyn TaskQueue>,
}

// =============================================================================
// Supervisor
// =============================================================================

struct RunningTasks {
    ticker: JoinHandle<()>,
    ticker_cancel: CancellationToken,
    intakes: Vec<JoinHandle<()>>,
    intake_cancel: CancellationToken,
    flushers: Vec<JoinHandle<()>>,
    flusher_cancel: CancellationToken,
}

/// Owner of the running pipeline.
pub struct PipelineSupervisor {
    config: BridgeConfig,
    started_at: Instant,
    hub: SharedBroadcastHub,
    subscriptions: SubscriptionHandle,
    registry: Arc<SubscriptionRegistry>,
    state_sync: Arc<StateSync>,
    dispatcher: Arc<TaskDispatcher>,
    connection: watch::Receiver<ConnectionSnapshot>,
    sequence: Arc<SequenceSource>,
    shutdown_requested: CancellationToken,
    stopped: AtomicBool,
    tasks: Mutex<Option<RunningTasks>>,
}

impl PipelineSupervisor {
    /// Validate, probe the sinks, seed the registry and start every task.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError` if the configuration is invalid, a sink is
    /// unreachable or the default instruments exceed the registry bound.
    pub async fn start(config: BridgeConfig, deps: PipelineDeps) -> Result<Self, PipelineError> {
        config.validate()?;

        deps.store
            .check()
            .await
            .map_err(PipelineError::StoreUnreachable)?;
        deps.queue
            .check()
            .await
            .map_err(PipelineError::QueueUnreachable)?;
        tracing::info!("State store and task queue reachable");

        let registry = Arc::new(SubscriptionRegistry::new(
            config.subscriptions.max_instruments,
        ));
        let defaults: Vec<Subscription> = config
            .subscriptions
            .default_instruments
            .iter()
            .map(|token| Subscription::new(*token, config.subscriptions.default_mode))
            .collect();
        registry.subscribe_many(&defaults)?;
        metrics::set_subscriptions(registry.len());

        let hub = Arc::new(BroadcastHub::new(&config.broadcast));
        let state_sync = Arc::new(StateSync::new(
            Arc::clone(&deps.store),
            config.state_sync.clone(),
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&deps.queue),
            config.dispatch.clone(),
        ));

        let intake_cancel = CancellationToken::new();
        let flusher_cancel = CancellationToken::new();
        let ticker_cancel = CancellationToken::new();

        // Consumers subscribe before the ticker can publish.
        let intakes = vec![
            tokio::spawn(
                Arc::clone(&state_sync)
                    .run_intake(hub.ticks_rx("state_sync"), intake_cancel.clone()),
            ),
            tokio::spawn(
                Arc::clone(&dispatcher)
                    .run_intake(hub.ticks_rx("dispatcher"), intake_cancel.clone()),
            ),
        ];
        let flushers = vec![
            tokio::spawn(Arc::clone(&state_sync).run_flusher(flusher_cancel.clone())),
            tokio::spawn(Arc::clone(&dispatcher).run_flusher(flusher_cancel.clone())),
        ];

        let ticker = Ticker::new(
            TickerConfig::from_websocket_settings(&config.websocket),
            deps.transport,
            deps.tokens,
            Arc::clone(&registry),
            Arc::clone(&hub),
            ticker_cancel.clone(),
        );
        let connection = ticker.snapshots();
        let sequence = ticker.sequence();
        let ticker = tokio::spawn(ticker.run());

        tracing::info!(
            instruments = registry.len(),
            overflow = config.dispatch.overflow.as_str(),
            "Pipeline started"
        );

        Ok(Self {
            subscriptions: SubscriptionHandle::new(Arc::clone(&registry), Arc::clone(&state_sync)),
            config,
            started_at: Instant::now(),
            hub,
            registry,
            state_sync,
            dispatcher,
            connection,
            sequence,
            shutdown_requested: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Some(RunningTasks {
                ticker,
                ticker_cancel,
                intakes,
                intake_cancel,
                flushers,
                flusher_cancel,
            })),
        })
    }

    /// Subscription control handle.
    #[must_use]
    pub fn subscriptions(&self) -> SubscriptionHandle {
        self.subscriptions.clone()
    }

    /// Broadcast hub (for additional observers).
    #[must_use]
    pub fn hub(&self) -> SharedBroadcastHub {
        Arc::clone(&self.hub)
    }

    /// Receiver of connection snapshots.
    #[must_use]
    pub fn connection(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.connection.clone()
    }

    /// State sync (for reads of last-known state).
    #[must_use]
    pub fn state_sync(&self) -> Arc<StateSync> {
        Arc::clone(&self.state_sync)
    }

    /// Token cancelled when something asks the process to stop.
    ///
    /// Cancelling it does not stop the pipeline; the owner does that.
    #[must_use]
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.shutdown_requested.clone()
    }

    /// Worst-of health across the connection and both sinks.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let connection = self.connection.borrow().clone();
        let state_sync = self.state_sync.stats();
        let dispatcher = self.dispatcher.stats();

        let status = if self.stopped.load(Ordering::Acquire) {
            HealthStatus::Stopped
        } else {
            let connection_status = match connection.state {
                ConnectionState::Closing => HealthStatus::Stopped,
                _ if connection.degraded => HealthStatus::Degraded,
                ConnectionState::Live => HealthStatus::Live,
                _ => HealthStatus::Reconnecting,
            };
            let sink_status = if state_sync.degraded || dispatcher.degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Live
            };
            connection_status.max(sink_status)
        };

        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            connection,
            last_sequence: self.sequence.last(),
            subscriptions: self.registry.len(),
            hub_lagged: self.hub.lagged_total(),
            state_sync,
            dispatcher,
        }
    }

    /// Stop everything in reverse start order.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` if the pipeline was already stopped.
    pub async fn stop(&self) -> Result<ShutdownReport, PipelineError> {
        let tasks = self.tasks.lock().take().ok_or(PipelineError::NotRunning)?;
        let started = Instant::now();
        tracing::info!("Stopping pipeline");

        tasks.ticker_cancel.cancel();
        await_task("ticker", tasks.ticker).await;

        tasks.intake_cancel.cancel();
        for intake in tasks.intakes {
            await_task("intake", intake).await;
        }

        self.dispatcher.close();
        tasks.flusher_cancel.cancel();
        for flusher in tasks.flushers {
            await_task("flusher", flusher).await;
        }

        let drain = self.dispatcher.drain(self.config.server.drain_grace).await;
        let final_flush = self.state_sync.flush().await;
        self.stopped.store(true, Ordering::Release);

        let dispatcher = self.dispatcher.stats();
        let state_sync = self.state_sync.stats();
        let connection = self.connection.borrow().clone();
        let report = ShutdownReport {
            ticks_received: self.sequence.last(),
            reconnects: connection.reconnects,
            dispatched: dispatcher.flushed,
            dispatch_dropped: dispatcher.dropped,
            drain,
            state_writes: state_sync.writes,
            state_unflushed: state_sync.dirty,
            hub_lagged: self.hub.lagged_total(),
            stop_duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        tracing::info!(
            ticks = report.ticks_received,
            dispatched = report.dispatched,
            dropped = report.dispatch_dropped,
            final_writes = final_flush.written,
            unflushed = report.state_unflushed,
            "Pipeline stopped"
        );
        Ok(report)
    }

    /// Drain grace configured for stop.
    #[must_use]
    pub const fn drain_grace(&self) -> Duration {
        self.config.server.drain_grace
    }
}

async fn await_task(name: &'static str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        tracing::error!(task = name, error = %e, "Pipeline task failed");
    }
}

// =============================================================================
// Tests
// =============================================================================
