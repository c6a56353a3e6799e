//! Starts one orchestration instance per newly observed item.

use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::core::{Orchestrator, SUMMARIZE_DOCUMENT};

/// Errors parsing an item reference
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemRefError {
    #[error("Item reference is empty")]
    Empty,

    #[error("Item reference '{0}' does not name an item")]
    NoItem(String),
}

/// A container-qualified item path such as `input/report.pdf`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    container: Option<String>,
    item_id: String,
}

impl ItemRef {
    /// Parse a reference. The item id is the trailing path segment.
    pub fn parse(reference: &str) -> Result<Self, ItemRefError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ItemRefError::Empty);
        }

        let segments: Vec<&str> = reference.split(['/', '\\']).collect();
        let item_id = segments.last().copied().unwrap_or_default();
        if item_id.is_empty() || item_id == "." || item_id == ".." {
            return Err(ItemRefError::NoItem(reference.to_string()));
        }

        let container = (segments.len() > 1)
            .then(|| segments[0])
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        Ok(Self {
            container,
            item_id: item_id.to_string(),
        })
    }

    /// Stable identifier, independent of any path prefix
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }
}

/// Turns new items into pipeline instances
#[derive(Clone)]
pub struct Dispatcher {
    orchestrator: Orchestrator,
    pipeline: String,
}

impl Dispatcher {
    /// Dispatch into the built-in summarize-document pipeline
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self::for_pipeline(orchestrator, SUMMARIZE_DOCUMENT)
    }

    pub fn for_pipeline(orchestrator: Orchestrator, pipeline: impl Into<String>) -> Self {
        Self {
            orchestrator,
            pipeline: pipeline.into(),
        }
    }

    /// Start exactly one instance for the item, with its id as input.
    /// Pipeline outcomes are not inspected here.
    #[instrument(skip(self), fields(pipeline = %self.pipeline))]
    pub async fn on_new_item(&self, item_ref: &str) -> anyhow::Result<Uuid> {
        let item = ItemRef::parse(item_ref)?;

        let instance_id = self
            .orchestrator
            .start(&self.pipeline, Value::String(item.item_id().to_string()))
            .await?;

        info!(item_id = item.item_id(), %instance_id, "Dispatched item");
        Ok(instance_id)
    }
}
