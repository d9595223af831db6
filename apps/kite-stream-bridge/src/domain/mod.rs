//! Domain Layer - Core market data types and business logic.
//!
//! This layer contains the tick model, the subscription registry and the
//! backoff policy. Nothing here performs I/O.

/// Instrument tokens, modes and tick events.
pub mod ticks;

/// Desired-state subscription registry.
pub mod subscription;

/// Exponential backoff with jitter.
pub mod backoff;
