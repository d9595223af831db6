//! Health Check, Metrics and Subscription Control Endpoint
//!
//! HTTP endpoint for health checks, connection status reporting, Prometheus
//! metrics and runtime subscription changes.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health report (503 once stopped)
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (200 only while LIVE)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /subscriptions` - Current desired subscriptions
//! - `POST /subscriptions` - Subscribe `{"token": 408065, "mode": "full"}`
//! - `PUT /subscriptions/{token}` - Change mode `{"mode": "ltp"}`
//! - `DELETE /subscriptions/{token}` - Unsubscribe

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{HealthStatus, PipelineSupervisor};
use crate::domain::subscription::{RegistryError, Subscription, SubscriptionDiff};
use crate::domain::ticks::{InstrumentToken, SubscriptionMode};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Request / Response Types
// =============================================================================

/// Body of `POST /subscriptions`.
#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    /// Instrument token.
    pub token: u32,
    /// Mode name (`ltp`, `quote`, `full`); the default mode if absent.
    pub mode: Option<String>,
}

/// Body of `PUT /subscriptions/{token}`.
#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    /// Mode name.
    pub mode: String,
}

/// Result of a subscription change.
#[derive(Debug, Serialize)]
pub struct DiffResponse {
    /// Subscriptions requested (new or mode changed).
    pub subscribe: Vec<Subscription>,
    /// Tokens dropped.
    pub unsubscribe: Vec<InstrumentToken>,
}

impl From<SubscriptionDiff> for DiffResponse {
    fn from(diff: SubscriptionDiff) -> Self {
        Self {
            subscribe: diff.subscribe,
            unsubscribe: diff.unsubscribe,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
        .into_response()
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    supervisor: Arc<PipelineSupervisor>,
    default_mode: SubscriptionMode,
    cancel: CancellationToken,
}

#[derive(Clone)]
struct AppState {
    supervisor: Arc<PipelineSupervisor>,
    default_mode: SubscriptionMode,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(
        port: u16,
        supervisor: Arc<PipelineSupervisor>,
        default_mode: SubscriptionMode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            supervisor,
            default_mode,
            cancel,
        }
    }

    /// Routes served by the health server.
    pub fn router(supervisor: Arc<PipelineSupervisor>, default_mode: SubscriptionMode) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .route(
                "/subscriptions",
                get(list_subscriptions).post(subscribe_handler),
            )
            .route(
                "/subscriptions/{token}",
                put(change_mode_handler).delete(unsubscribe_handler),
            )
            .with_state(AppState {
                supervisor,
                default_mode,
            })
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Self::router(self.supervisor, self.default_mode);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.supervisor.health();
    let status_code = match report.status {
        HealthStatus::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Live | HealthStatus::Reconnecting | HealthStatus::Degraded => StatusCode::OK,
    };
    (status_code, Json(report))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.supervisor.health().is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

async fn list_subscriptions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.subscriptions().snapshot())
}

async fn subscribe_handler(
    State(state): State<AppState>,
    Json(request): Json<SubscribeRequest>,
) -> Response {
    let mode = match request.mode.as_deref() {
        None => state.default_mode,
        Some(name) => match SubscriptionMode::from_str_case_insensitive(name) {
            Some(mode) => mode,
            None => return error_response(StatusCode::BAD_REQUEST, format!("unknown mode {name:?}")),
        },
    };

    match state
        .supervisor
        .subscriptions()
        .subscribe(InstrumentToken::new(request.token), mode)
    {
        Ok(diff) => (StatusCode::OK, Json(DiffResponse::from(diff))).into_response(),
        Err(e) => registry_error(&e),
    }
}

async fn change_mode_handler(
    State(state): State<AppState>,
    Path(token): Path<u32>,
    Json(request): Json<ModeRequest>,
) -> Response {
    let Some(mode) = SubscriptionMode::from_str_case_insensitive(&request.mode) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unknown mode {:?}", request.mode),
        );
    };

    match state
        .supervisor
        .subscriptions()
        .change_mode(InstrumentToken::new(token), mode)
    {
        Ok(diff) => (StatusCode::OK, Json(DiffResponse::from(diff))).into_response(),
        Err(e) => registry_error(&e),
    }
}

async fn unsubscribe_handler(
    State(state): State<AppState>,
    Path(token): Path<u32>,
) -> impl IntoResponse {
    let diff = state
        .supervisor
        .subscriptions()
        .unsubscribe(InstrumentToken::new(token))
        .await;
    Json(DiffResponse::from(diff))
}

fn registry_error(error: &RegistryError) -> Response {
    let status = match error {
        RegistryError::CapacityExceeded { .. } => StatusCode::CONFLICT,
        RegistryError::NotSubscribed(_) => StatusCode::NOT_FOUND,
    };
    error_response(status, error)
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{FeedSession, FeedTransport, TransportError};
    use crate::application::services::PipelineDeps;
    use crate::infrastructure::config::{BridgeConfig, Credentials};
    use crate::infrastructure::kite::StaticAccessToken;
    use crate::infrastructure::memory::in_memory_sinks;

    struct Unreachable;

    #[async_trait]
    impl FeedTransport for Unreachable {
        async fn connect(&self, _url: &str) -> Result<Box<dyn FeedSession>, TransportError> {
            Err(TransportError::Connect("connection refused".into()))
        }
    }

    async fn app() -> (Router, Arc<PipelineSupervisor>) {
        let credentials = Credentials::new("key".into(), "token".into());
        let mut config = BridgeConfig::with_credentials(credentials.clone());
        config.subscriptions.max_instruments = 4;
        let (store, queue) = in_memory_sinks();
        let supervisor = Arc::new(
            PipelineSupervisor::start(
                config,
                PipelineDeps {
                    transport: Arc::new(Unreachable),
                    tokens: Arc::new(StaticAccessToken::new(credentials)),
                    store,
                    queue,
                },
            )
            .await
            .unwrap(),
        );
        (
            HealthServer::router(Arc::clone(&supervisor), SubscriptionMode::Full),
            supervisor,
        )
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn not_ready_until_live() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_reports_and_turns_unavailable_after_stop() {
        let (app, supervisor) = app().await;
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["subscriptions"], 3);
        assert_ne!(body["status"], "live");

        supervisor.stop().await.unwrap();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["status"], "stopped");
    }

    #[tokio::test]
    async fn subscribe_change_and_unsubscribe() {
        let (app, supervisor) = app().await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/subscriptions",
                r#"{"token": 408065, "mode": "quote"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["subscribe"][0]["token"], 408_065);

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/subscriptions/408065", r#"{"mode": "LTP"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            supervisor
                .subscriptions()
                .mode_of(InstrumentToken::new(408_065)),
            Some(SubscriptionMode::Ltp)
        );

        let response = app
            .clone()
            .oneshot(
                Request::delete("/subscriptions/408065")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["unsubscribe"][0], 408_065);

        let response = app
            .oneshot(Request::get("/subscriptions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn subscription_errors_map_to_status_codes() {
        let (app, _) = app().await;

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/subscriptions/1", r#"{"mode": "full"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/subscriptions",
                r#"{"token": 1, "mode": "depth"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Capacity is 4 with 3 defaults seeded.
        app.clone()
            .oneshot(json_request("POST", "/subscriptions", r#"{"token": 1}"#))
            .await
            .unwrap();
        let response = app
            .oneshot(json_request("POST", "/subscriptions", r#"{"token": 2}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
