//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `StateSync`: coalescing write-through to the state store
//! - `TaskDispatcher`: batched, bounded handoff to the task queue
//! - `SubscriptionHandle`: caller control over the registry
//! - `PipelineSupervisor`: lifecycle and health of the whole pipeline

pub mod dispatcher;
pub mod state_sync;
pub mod subscriptions;
pub mod supervisor;

pub use dispatcher::{DispatcherStats, DrainReport, SubmitOutcome, TaskDispatcher};
pub use state_sync::{CoalescedState, FlushOutcome, StateSync, StateSyncError, StateSyncStats};
pub use subscriptions::SubscriptionHandle;
pub use supervisor::{
    HealthReport, HealthStatus, PipelineDeps, PipelineError, PipelineSupervisor, ShutdownReport,
};
