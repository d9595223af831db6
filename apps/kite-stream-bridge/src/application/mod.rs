//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (feed, state store, task queue).
pub mod ports;

/// Application services for state sync, dispatch and pipeline lifecycle.
pub mod services;
