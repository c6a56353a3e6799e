//! History events for the replay-based orchestrator.
//!
//! Every state change of an orchestration instance is recorded as an
//! immutable event in an append-only log. Anything that is not
//! deterministic (activity outputs, timer deadlines) enters the log exactly
//! once and is read back from it on every replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::failure::ActivityError;

/// A single event in an instance's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// Position in the instance history (1-based, contiguous)
    pub sequence: u64,

    /// When this event was recorded
    pub timestamp: DateTime<Utc>,

    /// The instance this event belongs to
    pub instance_id: Uuid,

    /// What happened
    pub kind: EventKind,

    /// Wall time the activity attempt took (outcome events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(instance_id: Uuid, sequence: u64, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            instance_id,
            kind,
            duration_ms: None,
        }
    }

    /// Stamp the event with a time taken from an injected clock
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// The pipeline step this event refers to, if any
    pub fn step_index(&self) -> Option<usize> {
        match &self.kind {
            EventKind::StepScheduled { step_index, .. }
            | EventKind::StepSucceeded { step_index, .. }
            | EventKind::StepFailed { step_index, .. }
            | EventKind::TimerCreated { step_index, .. }
            | EventKind::TimerFired { step_index, .. } => Some(*step_index),
            _ => None,
        }
    }

    /// Whether this event ends the instance
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::InstanceCompleted { .. }
                | EventKind::InstanceFailed { .. }
                | EventKind::InstanceCancelled { .. }
        )
    }

    /// Short human-readable description (no payloads)
    pub fn summary(&self) -> String {
        match &self.kind {
            EventKind::InstanceStarted { pipeline, .. } => {
                format!("instance started (pipeline '{}')", pipeline)
            }
            EventKind::StepScheduled {
                step_index,
                activity_name,
                attempt,
                ..
            } => format!(
                "step {} '{}' attempt {} scheduled",
                step_index, activity_name, attempt
            ),
            EventKind::StepSucceeded {
                step_index,
                activity_name,
                attempt,
                ..
            } => format!(
                "step {} '{}' attempt {} succeeded",
                step_index, activity_name, attempt
            ),
            EventKind::StepFailed {
                step_index,
                activity_name,
                attempt,
                error,
            } => format!(
                "step {} '{}' attempt {} failed: {}",
                step_index, activity_name, attempt, error
            ),
            EventKind::TimerCreated {
                step_index,
                attempt,
                fire_at,
            } => format!(
                "retry timer for step {} attempt {} due at {}",
                step_index, attempt, fire_at
            ),
            EventKind::TimerFired {
                step_index,
                attempt,
            } => format!("retry timer for step {} attempt {} fired", step_index, attempt),
            EventKind::InstanceCompleted { .. } => "instance completed".to_string(),
            EventKind::InstanceFailed { error } => format!("instance failed: {}", error),
            EventKind::InstanceCancelled { reason } => {
                format!("instance cancelled: {}", reason)
            }
        }
    }
}

/// Types of events, with the data each one captures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
    /// Instance created by the dispatcher
    InstanceStarted { pipeline: String, input: Value },

    /// An activity attempt was handed to the executor
    StepScheduled {
        step_index: usize,
        activity_name: String,
        attempt: u32,
        input: Value,
        idempotency_key: String,
    },

    /// An activity attempt returned a value
    StepSucceeded {
        step_index: usize,
        activity_name: String,
        attempt: u32,
        output: Value,
    },

    /// An activity attempt failed
    StepFailed {
        step_index: usize,
        activity_name: String,
        attempt: u32,
        error: ActivityError,
    },

    /// Retry delay before `attempt`, captured as an absolute deadline
    TimerCreated {
        step_index: usize,
        attempt: u32,
        fire_at: DateTime<Utc>,
    },

    /// Retry delay before `attempt` has elapsed
    TimerFired { step_index: usize, attempt: u32 },

    /// Every step succeeded
    InstanceCompleted { result: Value },

    /// A step exhausted its retry budget or failed permanently
    InstanceFailed { error: ActivityError },

    /// Instance was cancelled; no further events are accepted
    InstanceCancelled { reason: String },
}

/// Outcome of one activity attempt, as seen by a reader of the history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StepOutcome {
    Scheduled,
    Succeeded { value: Value },
    Failed { error: ActivityError },
}
