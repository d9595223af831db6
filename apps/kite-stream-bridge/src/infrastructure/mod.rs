//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the process
//! plumbing (configuration, telemetry, metrics, the health server).

/// Kite ticker protocol, transport and connection state machine.
pub mod kite;

/// Broadcast channels fanning ticks out to the pipeline consumers.
pub mod broadcast;

/// Configuration loading.
pub mod config;

/// Health check and subscription control HTTP endpoint.
pub mod health;

/// In-process sinks for tests and dry runs.
pub mod memory;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Redis state store, Celery broker and control keys.
pub mod redis;

/// OpenTelemetry tracing integration.
pub mod telemetry;
