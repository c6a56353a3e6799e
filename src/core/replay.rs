//! Deterministic replay of instance history.
//!
//! `replay` is a pure function: given a pipeline and the recorded history
//! of one instance it rebuilds the step outputs, re-evaluates each step's
//! input projection and decides the single next thing the engine has to do.
//! It performs no I/O, reads no clock and never invokes an activity, so
//! replaying the same history always yields the same decision.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ActivityError, Event, EventKind, InstanceView};

use super::event_store::generate_idempotency_key;
use super::pipeline::{MissingOutput, Pipeline, Step};

/// One activity attempt to run (or already running)
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityCall {
    pub step_index: usize,
    pub step_name: String,
    pub activity_name: String,
    pub attempt: u32,
    pub input: Value,
    pub idempotency_key: String,
}

/// What the engine must do next for an instance
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Record `step_scheduled` and hand the call to the executor
    ScheduleActivity(ActivityCall),

    /// The attempt is scheduled; wait for its outcome
    AwaitActivity(ActivityCall),

    /// The last attempt failed and may be retried after `delay`
    ScheduleRetry {
        step_index: usize,
        attempt: u32,
        delay: Duration,
    },

    /// A retry timer is pending until `fire_at`
    AwaitTimer {
        step_index: usize,
        attempt: u32,
        fire_at: DateTime<Utc>,
    },

    /// Every step succeeded
    Complete { result: Value },

    /// A step failed terminally
    Fail { error: ActivityError },

    /// The instance already finished; nothing to do
    Terminal,
}

/// Result of replaying a history
#[derive(Debug, Clone)]
pub struct Replay {
    pub view: InstanceView,
    pub decision: Decision,
}

/// History that cannot be replayed safely. Instances hitting one of these
/// are quarantined, never resumed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("history is empty")]
    EmptyHistory,

    #[error("history must begin with instance_started")]
    MissingStart,

    #[error("history belongs to pipeline '{recorded}', not '{expected}'")]
    PipelineMismatch { recorded: String, expected: String },

    #[error("event sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("event {sequence} belongs to instance {found}, expected {expected}")]
    ForeignEvent {
        sequence: u64,
        expected: Uuid,
        found: Uuid,
    },

    #[error("event {sequence} recorded after the instance finished")]
    EventAfterTerminal { sequence: u64 },

    #[error("event {sequence} refers to step {step_index}, pipeline has {len} steps")]
    UnknownStep {
        sequence: u64,
        step_index: usize,
        len: usize,
    },

    #[error("event {sequence} for step {step_index} recorded before step {current} succeeded")]
    OutOfOrder {
        sequence: u64,
        step_index: usize,
        current: usize,
    },

    #[error("step {step_index} runs activity '{expected}', history recorded '{found}'")]
    ActivityMismatch {
        step_index: usize,
        expected: String,
        found: String,
    },

    #[error("step {step_index} input no longer matches the recorded input")]
    InputMismatch { step_index: usize },

    #[error("step {step_index} input cannot be derived: {source}")]
    Projection {
        step_index: usize,
        source: MissingOutput,
    },

    #[error("event {sequence} is not valid here: {detail}")]
    Unexpected { sequence: u64, detail: String },
}

/// Progress of the step currently being resolved
#[derive(Debug, Clone)]
enum Phase {
    NotStarted,
    Scheduled { call: ActivityCall },
    RetryPending { attempt: u32, error: ActivityError },
    TimerPending { attempt: u32, fire_at: DateTime<Utc> },
    TimerFired { attempt: u32 },
    Failed { error: ActivityError },
}

/// Replay `history` against `pipeline` and decide the next action
pub fn replay(pipeline: &Pipeline, history: &[Event]) -> Result<Replay, ReplayError> {
    let first = history.first().ok_or(ReplayError::EmptyHistory)?;
    let instance_id = first.instance_id;

    let input = match &first.kind {
        EventKind::InstanceStarted { pipeline: recorded, input } => {
            if recorded != &pipeline.name {
                return Err(ReplayError::PipelineMismatch {
                    recorded: recorded.clone(),
                    expected: pipeline.name.clone(),
                });
            }
            input.clone()
        }
        _ => return Err(ReplayError::MissingStart),
    };

    for (i, event) in history.iter().enumerate() {
        let expected = i as u64 + 1;
        if event.sequence != expected {
            return Err(ReplayError::SequenceGap {
                expected,
                found: event.sequence,
            });
        }
        if event.instance_id != instance_id {
            return Err(ReplayError::ForeignEvent {
                sequence: event.sequence,
                expected: instance_id,
                found: event.instance_id,
            });
        }
        if event.is_terminal() && i + 1 != history.len() {
            return Err(ReplayError::EventAfterTerminal {
                sequence: history[i + 1].sequence,
            });
        }
    }

    let mut walker = Walker {
        pipeline,
        instance_id,
        input: &input,
        outputs: BTreeMap::new(),
        current: 0,
        phase: Phase::NotStarted,
    };

    for event in &history[1..] {
        walker.apply(event)?;
    }

    let view = InstanceView::from_events(history).ok_or(ReplayError::EmptyHistory)?;

    let decision = if history.last().map(Event::is_terminal).unwrap_or(false) {
        Decision::Terminal
    } else {
        walker.decide()?
    };

    Ok(Replay { view, decision })
}

struct Walker<'a> {
    pipeline: &'a Pipeline,
    instance_id: Uuid,
    input: &'a Value,
    outputs: BTreeMap<String, Value>,
    current: usize,
    phase: Phase,
}

impl Walker<'_> {
    fn apply(&mut self, event: &Event) -> Result<(), ReplayError> {
        if event.is_terminal() {
            // Validated as last event by the caller
            return Ok(());
        }

        let sequence = event.sequence;
        let unexpected = |detail: &str| ReplayError::Unexpected {
            sequence,
            detail: detail.to_string(),
        };

        let step_index = event
            .step_index()
            .ok_or_else(|| unexpected("duplicate instance_started"))?;

        if step_index >= self.pipeline.steps.len() {
            return Err(ReplayError::UnknownStep {
                sequence,
                step_index,
                len: self.pipeline.steps.len(),
            });
        }
        if step_index > self.current {
            return Err(ReplayError::OutOfOrder {
                sequence,
                step_index,
                current: self.current,
            });
        }
        if step_index < self.current {
            return Err(unexpected("step was already resolved"));
        }

        let step = &self.pipeline.steps[step_index];
        let phase = std::mem::replace(&mut self.phase, Phase::NotStarted);

        self.phase = match (phase, &event.kind) {
            (
                Phase::NotStarted,
                EventKind::StepScheduled {
                    activity_name,
                    attempt: 1,
                    input,
                    idempotency_key,
                    ..
                },
            ) => Phase::Scheduled {
                call: self.check_scheduled(step_index, step, activity_name, 1, input, idempotency_key)?,
            },

            (
                Phase::TimerFired { attempt: next },
                EventKind::StepScheduled {
                    activity_name,
                    attempt,
                    input,
                    idempotency_key,
                    ..
                },
            ) if *attempt == next => Phase::Scheduled {
                call: self.check_scheduled(step_index, step, activity_name, next, input, idempotency_key)?,
            },

            (
                Phase::Scheduled { call },
                EventKind::StepSucceeded {
                    activity_name,
                    attempt,
                    output,
                    ..
                },
            ) if *attempt == call.attempt => {
                check_activity(step_index, step, activity_name)?;
                self.outputs.insert(step.name.clone(), output.clone());
                self.current += 1;
                Phase::NotStarted
            }

            (
                Phase::Scheduled { call },
                EventKind::StepFailed {
                    activity_name,
                    attempt,
                    error,
                    ..
                },
            ) if *attempt == call.attempt => {
                check_activity(step_index, step, activity_name)?;
                if step.retry_policy.should_retry(call.attempt, error) {
                    Phase::RetryPending {
                        attempt: call.attempt,
                        error: error.clone(),
                    }
                } else {
                    Phase::Failed {
                        error: error.clone(),
                    }
                }
            }

            (Phase::RetryPending { attempt: failed, .. }, EventKind::TimerCreated { attempt, fire_at, .. })
                if *attempt == failed + 1 =>
            {
                Phase::TimerPending {
                    attempt: *attempt,
                    fire_at: *fire_at,
                }
            }

            (Phase::TimerPending { attempt: pending, .. }, EventKind::TimerFired { attempt, .. })
                if *attempt == pending =>
            {
                Phase::TimerFired { attempt: pending }
            }

            (Phase::Failed { .. }, _) => {
                return Err(unexpected("event recorded after the step failed terminally"));
            }

            (_, kind) => {
                return Err(unexpected(&format!(
                    "{} does not follow the recorded progress of step {}",
                    kind_name(kind),
                    step_index
                )));
            }
        };

        Ok(())
    }

    fn check_scheduled(
        &self,
        step_index: usize,
        step: &Step,
        activity_name: &str,
        attempt: u32,
        recorded_input: &Value,
        idempotency_key: &str,
    ) -> Result<ActivityCall, ReplayError> {
        check_activity(step_index, step, activity_name)?;

        let expected = self.project(step_index, step)?;
        if &expected != recorded_input {
            return Err(ReplayError::InputMismatch { step_index });
        }

        Ok(ActivityCall {
            step_index,
            step_name: step.name.clone(),
            activity_name: step.activity.clone(),
            attempt,
            input: expected,
            idempotency_key: idempotency_key.to_string(),
        })
    }

    fn project(&self, step_index: usize, step: &Step) -> Result<Value, ReplayError> {
        step.input_from
            .resolve(self.input, &self.outputs)
            .map_err(|source| ReplayError::Projection { step_index, source })
    }

    fn new_call(&self, attempt: u32) -> Result<ActivityCall, ReplayError> {
        let step = &self.pipeline.steps[self.current];
        let input = self.project(self.current, step)?;

        Ok(ActivityCall {
            step_index: self.current,
            step_name: step.name.clone(),
            activity_name: step.activity.clone(),
            attempt,
            idempotency_key: generate_idempotency_key(
                self.instance_id,
                &step.name,
                &input.to_string(),
            ),
            input,
        })
    }

    fn decide(&self) -> Result<Decision, ReplayError> {
        if self.current == self.pipeline.steps.len() {
            // An empty pipeline returns its input unchanged
            let result = self
                .pipeline
                .steps
                .last()
                .and_then(|s| self.outputs.get(&s.name))
                .cloned()
                .unwrap_or_else(|| self.input.clone());

            return Ok(Decision::Complete { result });
        }

        let step = &self.pipeline.steps[self.current];

        Ok(match &self.phase {
            Phase::NotStarted => Decision::ScheduleActivity(self.new_call(1)?),
            Phase::Scheduled { call } => Decision::AwaitActivity(call.clone()),
            Phase::RetryPending { attempt, .. } => Decision::ScheduleRetry {
                step_index: self.current,
                attempt: attempt + 1,
                delay: step.retry_policy.delay_after(*attempt),
            },
            Phase::TimerPending { attempt, fire_at } => Decision::AwaitTimer {
                step_index: self.current,
                attempt: *attempt,
                fire_at: *fire_at,
            },
            Phase::TimerFired { attempt } => Decision::ScheduleActivity(self.new_call(*attempt)?),
            Phase::Failed { error } => Decision::Fail {
                error: error.clone(),
            },
        })
    }
}

fn check_activity(step_index: usize, step: &Step, recorded: &str) -> Result<(), ReplayError> {
    if step.activity != recorded {
        return Err(ReplayError::ActivityMismatch {
            step_index,
            expected: step.activity.clone(),
            found: recorded.to_string(),
        });
    }
    Ok(())
}

fn kind_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::InstanceStarted { .. } => "instance_started",
        EventKind::StepScheduled { .. } => "step_scheduled",
        EventKind::StepSucceeded { .. } => "step_succeeded",
        EventKind::StepFailed { .. } => "step_failed",
        EventKind::TimerCreated { .. } => "timer_created",
        EventKind::TimerFired { .. } => "timer_fired",
        EventKind::InstanceCompleted { .. } => "instance_completed",
        EventKind::InstanceFailed { .. } => "instance_failed",
        EventKind::InstanceCancelled { .. } => "instance_cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::InputSource;
    use crate::core::retry::RetryPolicy;
    use crate::domain::InstanceStatus;
    use serde_json::json;

    /// Builds a history one event at a time with correct sequencing
    struct History {
        id: Uuid,
        events: Vec<Event>,
    }

    impl History {
        fn started(pipeline: &Pipeline, input: Value) -> Self {
            let mut history = Self {
                id: Uuid::new_v4(),
                events: Vec::new(),
            };
            history.push(EventKind::InstanceStarted {
                pipeline: pipeline.name.clone(),
                input,
            });
            history
        }

        fn push(&mut self, kind: EventKind) -> &mut Self {
            let seq = self.events.len() as u64 + 1;
            self.events.push(Event::new(self.id, seq, kind));
            self
        }

        fn schedule(&mut self, call: &ActivityCall) -> &mut Self {
            self.push(EventKind::StepScheduled {
                step_index: call.step_index,
                activity_name: call.activity_name.clone(),
                attempt: call.attempt,
                input: call.input.clone(),
                idempotency_key: call.idempotency_key.clone(),
            })
        }

        fn succeed(&mut self, call: &ActivityCall, output: Value) -> &mut Self {
            self.push(EventKind::StepSucceeded {
                step_index: call.step_index,
                activity_name: call.activity_name.clone(),
                attempt: call.attempt,
                output,
            })
        }

        fn fail(&mut self, call: &ActivityCall, error: ActivityError) -> &mut Self {
            self.push(EventKind::StepFailed {
                step_index: call.step_index,
                activity_name: call.activity_name.clone(),
                attempt: call.attempt,
                error,
            })
        }
    }

    fn pipeline(max_attempts: u32) -> Pipeline {
        Pipeline::summarize_document(RetryPolicy::fixed(max_attempts, Duration::from_secs(5)))
    }

    fn next_call(p: &Pipeline, h: &History) -> ActivityCall {
        match replay(p, &h.events).unwrap().decision {
            Decision::ScheduleActivity(call) => call,
            other => panic!("expected ScheduleActivity, got {:?}", other),
        }
    }

    #[test]
    fn test_fresh_instance_schedules_first_step() {
        let p = pipeline(3);
        let h = History::started(&p, json!("report.pdf"));

        let call = next_call(&p, &h);
        assert_eq!(call.step_index, 0);
        assert_eq!(call.activity_name, "extract");
        assert_eq!(call.attempt, 1);
        assert_eq!(call.input, json!("report.pdf"));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let p = pipeline(3);
        let mut h = History::started(&p, json!("report.pdf"));
        let extract = next_call(&p, &h);
        h.schedule(&extract).succeed(&extract, json!("text"));

        let first = replay(&p, &h.events).unwrap().decision;
        let second = replay(&p, &h.events).unwrap().decision;
        assert_eq!(first, second);
    }

    #[test]
    fn test_scheduled_step_is_awaited_not_rescheduled() {
        let p = pipeline(3);
        let mut h = History::started(&p, json!("report.pdf"));
        let extract = next_call(&p, &h);
        h.schedule(&extract);

        let decision = replay(&p, &h.events).unwrap().decision;
        assert_eq!(decision, Decision::AwaitActivity(extract));
    }

    #[test]
    fn test_outputs_flow_into_later_inputs() {
        let p = pipeline(3);
        let mut h = History::started(&p, json!("report.pdf"));

        let extract = next_call(&p, &h);
        h.schedule(&extract).succeed(&extract, json!("Quarterly revenue rose 8%."));

        let summarize = next_call(&p, &h);
        assert_eq!(summarize.step_index, 1);
        assert_eq!(summarize.input, json!("Quarterly revenue rose 8%."));
        h.schedule(&summarize).succeed(&summarize, json!("Revenue grew."));

        let persist = next_call(&p, &h);
        assert_eq!(persist.input, json!({"item_id": "report.pdf", "summary": "Revenue grew."}));
        h.schedule(&persist).succeed(&persist, json!("report.pdf-20250101120000.txt"));

        let decision = replay(&p, &h.events).unwrap().decision;
        assert_eq!(
            decision,
            Decision::Complete {
                result: json!("report.pdf-20250101120000.txt")
            }
        );
    }

    #[test]
    fn test_transient_failure_schedules_retry_timer() {
        let p = pipeline(3);
        let mut h = History::started(&p, json!("report.pdf"));
        let extract = next_call(&p, &h);
        h.schedule(&extract).fail(&extract, ActivityError::transient("503"));

        let decision = replay(&p, &h.events).unwrap().decision;
        assert_eq!(
            decision,
            Decision::ScheduleRetry {
                step_index: 0,
                attempt: 2,
                delay: Duration::from_secs(5),
            }
        );

        let fire_at = Utc::now();
        h.push(EventKind::TimerCreated {
            step_index: 0,
            attempt: 2,
            fire_at,
        });
        assert_eq!(
            replay(&p, &h.events).unwrap().decision,
            Decision::AwaitTimer {
                step_index: 0,
                attempt: 2,
                fire_at
            }
        );

        h.push(EventKind::TimerFired {
            step_index: 0,
            attempt: 2,
        });
        let retry = next_call(&p, &h);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.idempotency_key, extract.idempotency_key);
    }

    #[test]
    fn test_permanent_failure_fails_without_retry() {
        let p = pipeline(3);
        let mut h = History::started(&p, json!("report.pdf"));
        let extract = next_call(&p, &h);
        let error = ActivityError::permanent("400 bad document");
        h.schedule(&extract).fail(&extract, error.clone());

        let decision = replay(&p, &h.events).unwrap().decision;
        assert_eq!(decision, Decision::Fail { error });
    }

    #[test]
    fn test_exhausted_attempts_fail() {
        let p = pipeline(1);
        let mut h = History::started(&p, json!("report.pdf"));
        let extract = next_call(&p, &h);
        let error = ActivityError::transient("503");
        h.schedule(&extract).fail(&extract, error.clone());

        assert_eq!(replay(&p, &h.events).unwrap().decision, Decision::Fail { error });
    }

    #[test]
    fn test_empty_pipeline_completes_with_input() {
        let p = Pipeline {
            name: "empty".to_string(),
            description: String::new(),
            steps: Vec::new(),
        };
        let h = History::started(&p, json!("report.pdf"));

        assert_eq!(
            replay(&p, &h.events).unwrap().decision,
            Decision::Complete {
                result: json!("report.pdf")
            }
        );
    }

    #[test]
    fn test_terminal_history() {
        let p = pipeline(3);
        let mut h = History::started(&p, json!("report.pdf"));
        h.push(EventKind::InstanceCancelled {
            reason: "operator".to_string(),
        });

        let replayed = replay(&p, &h.events).unwrap();
        assert_eq!(replayed.decision, Decision::Terminal);
        assert_eq!(replayed.view.status, InstanceStatus::Cancelled);
    }

    #[test]
    fn test_step_before_previous_succeeded_is_rejected() {
        let p = pipeline(3);
        let mut h = History::started(&p, json!("report.pdf"));
        h.push(EventKind::StepScheduled {
            step_index: 1,
            activity_name: "summarize".to_string(),
            attempt: 1,
            input: json!("text"),
            idempotency_key: "k".to_string(),
        });

        let err = replay(&p, &h.events).unwrap_err();
        assert!(matches!(err, ReplayError::OutOfOrder { step_index: 1, current: 0, .. }));
    }

    #[test]
    fn test_changed_input_projection_is_divergence() {
        let p = pipeline(3);
        let mut h = History::started(&p, json!("report.pdf"));
        let mut extract = next_call(&p, &h);
        extract.input = json!("other.pdf");
        h.schedule(&extract);

        assert_eq!(
            replay(&p, &h.events).unwrap_err(),
            ReplayError::InputMismatch { step_index: 0 }
        );
    }

    #[test]
    fn test_pipeline_mismatch() {
        let p = pipeline(3);
        let h = History::started(&p, json!("report.pdf"));
        let other = Pipeline {
            name: "other".to_string(),
            description: String::new(),
            steps: vec![Step::new("a", "a", InputSource::pipeline_input())],
        };

        assert!(matches!(
            replay(&other, &h.events),
            Err(ReplayError::PipelineMismatch { .. })
        ));
    }

    #[test]
    fn test_sequence_gap() {
        let p = pipeline(3);
        let mut h = History::started(&p, json!("report.pdf"));
        h.events.push(Event::new(
            h.id,
            5,
            EventKind::TimerFired {
                step_index: 0,
                attempt: 2,
            },
        ));

        assert_eq!(
            replay(&p, &h.events).unwrap_err(),
            ReplayError::SequenceGap {
                expected: 2,
                found: 5
            }
        );
    }

    #[test]
    fn test_outcome_without_schedule_is_rejected() {
        let p = pipeline(3);
        let mut h = History::started(&p, json!("report.pdf"));
        h.push(EventKind::StepSucceeded {
            step_index: 0,
            activity_name: "extract".to_string(),
            attempt: 1,
            output: json!("text"),
        });

        assert!(matches!(
            replay(&p, &h.events),
            Err(ReplayError::Unexpected { sequence: 2, .. })
        ));
    }

    #[test]
    fn test_empty_history() {
        assert_eq!(
            replay(&pipeline(3), &[]).unwrap_err(),
            ReplayError::EmptyHistory
        );
    }
}
