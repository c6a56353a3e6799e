//! Instance state reconstructed from history.
//!
//! An instance is one run of a pipeline for one input item. Its state is
//! never stored directly; it is folded from the event log on demand.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::events::{Event, EventKind, StepOutcome};
use super::failure::ActivityError;

/// Lifecycle status of an orchestration instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Steps remain to be resolved
    Running,

    /// Every step succeeded; `result` holds the final value
    Completed,

    /// A step failed terminally; `last_error` holds the cause
    Failed,

    /// Cancelled on request; `reason` holds the explanation
    Cancelled,

    /// History is inconsistent and the instance must not be resumed
    Quarantined,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Quarantined => "quarantined",
        };
        f.write_str(label)
    }
}

/// Per-step progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    pub step_index: usize,
    pub activity_name: String,

    /// Highest attempt number recorded so far
    pub attempts: u32,

    /// Outcome of the latest attempt
    pub outcome: StepOutcome,

    /// Deadline of a pending retry timer
    pub retry_at: Option<DateTime<Utc>>,
}

/// Queryable view of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: Uuid,
    pub pipeline: String,
    pub input: Value,
    pub status: InstanceStatus,

    /// Final output once `Completed`
    pub result: Option<Value>,

    /// Most recent activity failure (terminal cause once `Failed`)
    pub last_error: Option<ActivityError>,

    /// Cancellation or quarantine reason
    pub reason: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Steps that have at least one recorded event, by index
    pub steps: BTreeMap<usize, StepView>,

    /// Number of history events folded into this view
    pub event_count: usize,
}

impl InstanceView {
    /// Reconstruct instance state from its history
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;

        let mut view = Self {
            id: first.instance_id,
            pipeline: String::new(),
            input: Value::Null,
            status: InstanceStatus::Running,
            result: None,
            last_error: None,
            reason: None,
            started_at: first.timestamp,
            finished_at: None,
            steps: BTreeMap::new(),
            event_count: 0,
        };

        for event in events {
            view.apply_event(event);
        }

        Some(view)
    }

    /// Apply a single event
    pub fn apply_event(&mut self, event: &Event) {
        self.event_count += 1;

        match &event.kind {
            EventKind::InstanceStarted { pipeline, input } => {
                self.pipeline = pipeline.clone();
                self.input = input.clone();
                self.started_at = event.timestamp;
            }
            EventKind::StepScheduled {
                step_index,
                activity_name,
                attempt,
                ..
            } => {
                let step = self.step_entry(*step_index, activity_name);
                step.attempts = *attempt;
                step.outcome = StepOutcome::Scheduled;
                step.retry_at = None;
            }
            EventKind::StepSucceeded {
                step_index,
                activity_name,
                attempt,
                output,
            } => {
                let step = self.step_entry(*step_index, activity_name);
                step.attempts = *attempt;
                step.outcome = StepOutcome::Succeeded {
                    value: output.clone(),
                };
            }
            EventKind::StepFailed {
                step_index,
                activity_name,
                attempt,
                error,
            } => {
                let step = self.step_entry(*step_index, activity_name);
                step.attempts = *attempt;
                step.outcome = StepOutcome::Failed {
                    error: error.clone(),
                };
                self.last_error = Some(error.clone());
            }
            EventKind::TimerCreated {
                step_index,
                fire_at,
                ..
            } => {
                if let Some(step) = self.steps.get_mut(step_index) {
                    step.retry_at = Some(*fire_at);
                }
            }
            EventKind::TimerFired { step_index, .. } => {
                if let Some(step) = self.steps.get_mut(step_index) {
                    step.retry_at = None;
                }
            }
            EventKind::InstanceCompleted { result } => {
                self.status = InstanceStatus::Completed;
                self.result = Some(result.clone());
                self.finished_at = Some(event.timestamp);
            }
            EventKind::InstanceFailed { error } => {
                self.status = InstanceStatus::Failed;
                self.last_error = Some(error.clone());
                self.finished_at = Some(event.timestamp);
            }
            EventKind::InstanceCancelled { reason } => {
                self.status = InstanceStatus::Cancelled;
                self.reason = Some(reason.clone());
                self.finished_at = Some(event.timestamp);
            }
        }
    }

    fn step_entry(&mut self, step_index: usize, activity_name: &str) -> &mut StepView {
        self.steps.entry(step_index).or_insert_with(|| StepView {
            step_index,
            activity_name: activity_name.to_string(),
            attempts: 0,
            outcome: StepOutcome::Scheduled,
            retry_at: None,
        })
    }

    /// Mark the view as quarantined
    pub fn quarantined(mut self, reason: impl Into<String>) -> Self {
        self.status = InstanceStatus::Quarantined;
        self.reason = Some(reason.into());
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    /// Successful output of the step running `activity_name`, if recorded.
    ///
    /// Outputs stay in history even when a later step fails, so a summary
    /// whose persist step failed can still be read back from here.
    pub fn step_output(&self, activity_name: &str) -> Option<&Value> {
        self.steps
            .values()
            .find(|s| s.activity_name == activity_name)
            .and_then(|s| match &s.outcome {
                StepOutcome::Succeeded { value } => Some(value),
                _ => None,
            })
    }
}
