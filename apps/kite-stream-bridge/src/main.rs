//! Kite Stream Bridge Binary
//!
//! Starts the ticker ingestion pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin kite-stream-bridge
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `KITE_API_KEY`: Kite Connect API key
//! - `KITE_ACCESS_TOKEN`: Session access token
//!
//! ## Optional
//! - `KITE_TICKER_URL`: Ticker endpoint (default: wss://ws.kite.trade)
//! - `REDIS_URL`: State store and Celery broker (default: redis://127.0.0.1:6379/0)
//! - `BRIDGE_DEFAULT_INSTRUMENTS`: Comma-separated tokens seeded at start
//! - `BRIDGE_DEFAULT_MODE`: ltp | quote | full (default: full)
//! - `BRIDGE_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `CELERY_QUEUE`, `CELERY_TASK_NAME`: Celery routing
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Context;
use kite_stream_bridge::application::ports::{
    AccessTokenProvider, FeedTransport, StateStore, TaskQueue,
};
use kite_stream_bridge::infrastructure::kite::{StaticAccessToken, WsTransport};
use kite_stream_bridge::infrastructure::redis::{
    self as redis_infra, CeleryTaskQueue, ControlPoller, RedisStateStore,
};
use kite_stream_bridge::infrastructure::telemetry;
use kite_stream_bridge::{
    BridgeConfig, HealthServer, PipelineDeps, PipelineSupervisor, ShutdownReport, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Kite Stream Bridge");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = BridgeConfig::from_env().context("invalid configuration")?;
    config.validate().context("invalid configuration")?;
    log_config(&config);

    let redis_display = redis_infra::redact_password(&config.redis_url);
    let conn = redis_infra::connect(&config.redis_url)
        .await
        .with_context(|| format!("failed to connect to {redis_display}"))?;

    let transport: Arc<dyn FeedTransport> = Arc::new(WsTransport::new());
    let tokens: Arc<dyn AccessTokenProvider> =
        Arc::new(StaticAccessToken::new(config.credentials.clone()));
    let store: Arc<dyn StateStore> = Arc::new(RedisStateStore::new(conn.clone()));
    let queue: Arc<dyn TaskQueue> =
        Arc::new(CeleryTaskQueue::new(conn.clone(), config.celery.clone()));

    let supervisor = Arc::new(
        PipelineSupervisor::start(
            config.clone(),
            PipelineDeps {
                transport,
                tokens,
                store,
                queue,
            },
        )
        .await
        .context("pipeline failed to start")?,
    );

    let aux_cancel = CancellationToken::new();
    let default_mode = config.subscriptions.default_mode;

    let health_server = HealthServer::new(
        config.server.health_port,
        Arc::clone(&supervisor),
        default_mode,
        aux_cancel.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let poller = ControlPoller::new(
        conn,
        supervisor.subscriptions(),
        default_mode,
        supervisor.connection(),
        supervisor.hub().control_rx(),
        supervisor.shutdown_requested(),
        config.server.control_poll_interval,
    );
    let poller_task = tokio::spawn(poller.run(aux_cancel.clone()));

    tracing::info!("Kite stream bridge ready");

    await_shutdown(supervisor.shutdown_requested()).await;

    tracing::info!(
        grace_secs = supervisor.drain_grace().as_secs(),
        "Graceful shutdown started"
    );
    let report = supervisor.stop().await.context("pipeline stop failed")?;
    log_report(&report);

    aux_cancel.cancel();
    let _ = health_task.await;
    let _ = poller_task.await;

    tracing::info!("Kite stream bridge stopped");
    Ok(())
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        ticker_url = %config.websocket.url,
        redis_url = %redis_infra::redact_password(&config.redis_url),
        instruments = config.subscriptions.default_instruments.len(),
        mode = config.subscriptions.default_mode.as_str(),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        queue = %config.celery.queue,
        task = %config.celery.task_name,
        batch_size = config.dispatch.batch_size,
        overflow = config.dispatch.overflow.as_str(),
        "Dispatch settings"
    );
}

fn log_report(report: &ShutdownReport) {
    tracing::info!(
        ticks_received = report.ticks_received,
        reconnects = report.reconnects,
        dispatched = report.dispatched,
        dispatch_dropped = report.dispatch_dropped,
        drain_flushed = report.drain.flushed,
        drain_discarded = report.drain.discarded,
        state_writes = report.state_writes,
        state_unflushed = report.state_unflushed,
        hub_lagged = report.hub_lagged,
        stop_duration_ms = report.stop_duration_ms,
        "Shutdown report"
    );
}

/// Wait for SIGTERM, SIGINT or a stop requested through Redis.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_requested: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_requested.cancelled() => {
            tracing::info!("Stop requested, initiating shutdown");
        }
    }

    shutdown_requested.cancel();
}
