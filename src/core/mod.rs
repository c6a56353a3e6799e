//! Core orchestration logic.
//!
//! This module contains:
//! - EventStore: Append-only instance history
//! - Pipeline: Pipeline definitions and input projections
//! - RetryPolicy: Per-step retry bounds and delays
//! - Replay: Pure history → next-decision function
//! - Orchestrator: Durable execution engine

pub mod event_store;
pub mod orchestrator;
pub mod pipeline;
pub mod replay;
pub mod retry;

// Re-export commonly used types
pub use event_store::{
    generate_idempotency_key, hash_input, is_sequence_conflict, EventStore, QuarantineRecord,
    SequenceConflict,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, WorkItem, WorkerHandle};
pub use pipeline::{InputSource, Pipeline, Step, SUMMARIZE_DOCUMENT};
pub use replay::{replay, ActivityCall, Decision, Replay, ReplayError};
pub use retry::RetryPolicy;
