//! Domain types for the docsum orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of instance history
//! - Instance: State folded from history
//! - Failure: Activity errors recorded as data

pub mod events;
pub mod failure;
pub mod instance;

// Re-export commonly used types
pub use events::{Event, EventKind, StepOutcome};
pub use failure::{ActivityError, FailureKind};
pub use instance::{InstanceStatus, InstanceView, StepView};
