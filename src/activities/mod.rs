//! Activities: the units of external work a pipeline step invokes.
//!
//! An activity knows nothing about pipelines, history or retries. It gets
//! an input value, does its I/O through injected adapters and returns a
//! value or an `ActivityError`. The engine records whichever comes back.

pub mod extract;
pub mod persist;
pub mod summarize;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::ActivityError;

pub use extract::ExtractActivity;
pub use persist::{output_name, PersistActivity, PersistRequest};
pub use summarize::SummarizeActivity;

/// Invocation metadata handed to every activity attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityContext {
    pub instance_id: Uuid,
    pub step_index: usize,
    pub attempt: u32,

    /// Same for every attempt of a step, see `generate_idempotency_key`
    pub idempotency_key: String,

    /// When this attempt was recorded as scheduled. Identical on every
    /// delivery of the attempt, including re-dispatch after a restart.
    pub scheduled_at: DateTime<Utc>,
}

/// A named unit of work
#[async_trait]
pub trait Activity: Send + Sync {
    /// Name pipelines refer to
    fn name(&self) -> &str;

    /// Run one attempt
    async fn execute(&self, ctx: &ActivityContext, input: Value) -> Result<Value, ActivityError>;
}

/// Activities available to the engine, by name
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity under its own name, replacing any previous one
    pub fn register(&mut self, activity: Arc<dyn Activity>) -> &mut Self {
        self.activities.insert(activity.name().to_string(), activity);
        self
    }

    pub fn with(mut self, activity: Arc<dyn Activity>) -> Self {
        self.register(activity);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.activities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Extract a string input, rejecting anything else as permanent
pub(crate) fn expect_str<'a>(activity: &str, input: &'a Value) -> Result<&'a str, ActivityError> {
    input.as_str().ok_or_else(|| {
        ActivityError::permanent(format!(
            "{} expects a string input, got {}",
            activity, input
        ))
    })
}
