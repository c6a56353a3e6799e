//! Pipeline definitions and loading.
//!
//! A pipeline is an ordered list of steps. Each step names an activity,
//! derives its input from the instance input and earlier step outputs,
//! and carries its own retry policy. Pipelines can be defined in YAML or
//! built in code; `summarize-document` is always available.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::retry::RetryPolicy;

/// Name of the built-in extract → summarize → persist pipeline
pub const SUMMARIZE_DOCUMENT: &str = "summarize-document";

/// A complete pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (recorded in every instance history)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Ordered list of steps to execute
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// The document summarization pipeline: extract → summarize → persist
    pub fn summarize_document(retry_policy: RetryPolicy) -> Self {
        Self {
            name: SUMMARIZE_DOCUMENT.to_string(),
            description: "Extract document text, summarize it, write the summary".to_string(),
            steps: vec![
                Step::new("extract", "extract", InputSource::pipeline_input())
                    .with_retry_policy(retry_policy.clone()),
                Step::new("summarize", "summarize", InputSource::previous_step("extract"))
                    .with_retry_policy(retry_policy.clone()),
                Step::new(
                    "persist",
                    "persist",
                    InputSource::object([
                        ("item_id", InputSource::pipeline_input()),
                        ("summary", InputSource::previous_step("summarize")),
                    ]),
                )
                .with_retry_policy(retry_policy),
            ],
        }
    }

    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        let mut seen: HashSet<&str> = HashSet::new();

        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                anyhow::bail!("Step {} has an empty name", i);
            }
            if step.activity.is_empty() {
                anyhow::bail!("Step '{}' has no activity", step.name);
            }
            if !seen.insert(step.name.as_str()) {
                anyhow::bail!("Duplicate step name '{}'", step.name);
            }

            step.retry_policy
                .validate()
                .with_context(|| format!("Step '{}' has an invalid retry policy", step.name))?;

            // Only earlier steps may be referenced
            for reference in step.input_from.references() {
                if !seen.contains(reference) || reference == step.name {
                    let exists = self.steps.iter().any(|s| s.name == reference);
                    if exists {
                        anyhow::bail!(
                            "Step '{}' references future step '{}' (forward references not allowed)",
                            step.name,
                            reference
                        );
                    }
                    anyhow::bail!(
                        "Step '{}' references non-existent step '{}'",
                        step.name,
                        reference
                    );
                }
            }
        }

        Ok(())
    }

    /// Activity names used by this pipeline
    pub fn activity_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.activity.as_str()).collect()
    }
}

/// A single step in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within pipeline, used by input references)
    pub name: String,

    /// Registered activity to invoke
    pub activity: String,

    /// Where to get input from
    #[serde(default)]
    pub input_from: InputSource,

    /// Retry policy for this step
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl Step {
    pub fn new(name: impl Into<String>, activity: impl Into<String>, input_from: InputSource) -> Self {
        Self {
            name: name.into(),
            activity: activity.into(),
            input_from,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// Source of input for a step
///
/// Supports multiple YAML formats:
/// - Simple: `input_from: pipeline_input`
/// - Previous step: `input_from: { previous_step: step_name }`
/// - Object: `input_from: { object: { key: <source>, ... } }`
/// - Static: `input_from: { static: { key: value } }`
///
/// Resolution is a pure function of the instance input and earlier step
/// outputs, so it yields the same value on every replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSource {
    /// Use the instance's original input (simple string "pipeline_input")
    PipelineInput(PipelineInputMarker),

    /// Use output from a previous step
    PreviousStep { previous_step: String },

    /// Build a JSON object from other sources
    Object {
        object: BTreeMap<String, InputSource>,
    },

    /// Static value
    Static {
        #[serde(rename = "static")]
        value: Value,
    },
}

/// Marker for pipeline_input (deserializes from the string "pipeline_input")
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineInputMarker {
    PipelineInput,
}

impl Default for InputSource {
    fn default() -> Self {
        Self::pipeline_input()
    }
}

/// Input projection referenced a step output that is not available
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no output recorded for step '{0}'")]
pub struct MissingOutput(pub String);

impl InputSource {
    pub fn pipeline_input() -> Self {
        Self::PipelineInput(PipelineInputMarker::PipelineInput)
    }

    pub fn previous_step(name: impl Into<String>) -> Self {
        Self::PreviousStep {
            previous_step: name.into(),
        }
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, InputSource)>) -> Self {
        Self::Object {
            object: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Evaluate against the instance input and prior outputs (by step name)
    pub fn resolve(
        &self,
        pipeline_input: &Value,
        outputs: &BTreeMap<String, Value>,
    ) -> Result<Value, MissingOutput> {
        match self {
            Self::PipelineInput(_) => Ok(pipeline_input.clone()),

            Self::PreviousStep { previous_step } => outputs
                .get(previous_step)
                .cloned()
                .ok_or_else(|| MissingOutput(previous_step.clone())),

            Self::Object { object } => {
                let mut map = serde_json::Map::new();
                for (key, source) in object {
                    map.insert(key.clone(), source.resolve(pipeline_input, outputs)?);
                }
                Ok(Value::Object(map))
            }

            Self::Static { value } => Ok(value.clone()),
        }
    }

    /// Step names this source depends on
    pub fn references(&self) -> Vec<&str> {
        match self {
            Self::PreviousStep { previous_step } => vec![previous_step.as_str()],
            Self::Object { object } => object.values().flat_map(|s| s.references()).collect(),
            Self::PipelineInput(_) | Self::Static { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEST_PIPELINE_YAML: &str = r#"
name: test
description: Test pipeline

steps:
  - name: first
    activity: extract
    input_from: pipeline_input

  - name: second
    activity: summarize
    input_from:
      previous_step: first
    retry_policy:
      max_attempts: 5
      first_retry_delay_ms: 100

  - name: third
    activity: persist
    input_from:
      object:
        item_id: pipeline_input
        summary:
          previous_step: second
        tag:
          static: nightly
"#;

    #[test]
    fn test_pipeline_parsing() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();

        assert_eq!(pipeline.name, "test");
        assert_eq!(pipeline.steps.len(), 3);
        assert_eq!(pipeline.steps[0].retry_policy, RetryPolicy::default());
        assert_eq!(pipeline.steps[1].retry_policy.max_attempts, 5);
        assert_eq!(pipeline.steps[1].retry_policy.backoff_multiplier, 1.0);
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_object_projection() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();
        let outputs: BTreeMap<String, Value> = [
            ("first".to_string(), json!("text")),
            ("second".to_string(), json!("summary")),
        ]
        .into_iter()
        .collect();

        let input = pipeline.steps[2]
            .input_from
            .resolve(&json!("report.pdf"), &outputs)
            .unwrap();

        assert_eq!(
            input,
            json!({"item_id": "report.pdf", "summary": "summary", "tag": "nightly"})
        );
    }

    #[test]
    fn test_missing_output() {
        let source = InputSource::previous_step("extract");
        let err = source.resolve(&json!("x"), &BTreeMap::new()).unwrap_err();
        assert_eq!(err, MissingOutput("extract".to_string()));
    }

    #[test]
    fn test_invalid_step_reference() {
        let yaml = r#"
name: invalid
steps:
  - name: first
    activity: extract
    input_from:
      previous_step: nonexistent
"#;
        let pipeline = Pipeline::from_yaml(yaml).unwrap();
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_forward_reference_rejected() {
        let yaml = r#"
name: forward
steps:
  - name: first
    activity: extract
    input_from:
      previous_step: second
  - name: second
    activity: summarize
"#;
        let pipeline = Pipeline::from_yaml(yaml).unwrap();
        let err = pipeline.validate().unwrap_err();
        assert!(err.to_string().contains("future step"));
    }

    #[test]
    fn test_builtin_pipeline() {
        let pipeline = Pipeline::summarize_document(RetryPolicy::default());

        assert!(pipeline.validate().is_ok());
        assert_eq!(pipeline.activity_names(), vec!["extract", "summarize", "persist"]);
    }

    #[test]
    fn test_empty_pipeline_is_valid() {
        let pipeline = Pipeline::from_yaml("name: empty\n").unwrap();
        assert!(pipeline.steps.is_empty());
        assert!(pipeline.validate().is_ok());
    }
}
