//! `extract`: item id → document text.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument};

use crate::adapters::{BlobStore, LayoutAnalyzer, INPUT_CONTAINER};
use crate::domain::ActivityError;

use super::{expect_str, Activity, ActivityContext};

/// Reads the item from the `input` container and returns its text lines
pub struct ExtractActivity {
    blobs: Arc<dyn BlobStore>,
    analyzer: Arc<dyn LayoutAnalyzer>,
}

impl ExtractActivity {
    pub const NAME: &'static str = "extract";

    pub fn new(blobs: Arc<dyn BlobStore>, analyzer: Arc<dyn LayoutAnalyzer>) -> Self {
        Self { blobs, analyzer }
    }
}

#[async_trait]
impl Activity for ExtractActivity {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self, ctx, input), fields(instance_id = %ctx.instance_id, attempt = ctx.attempt))]
    async fn execute(&self, ctx: &ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let item_id = expect_str(Self::NAME, &input)?;

        let document = self.blobs.read(INPUT_CONTAINER, item_id).await?;
        let analyzed = self.analyzer.analyze(document).await?;
        let text = analyzed.text();

        info!(item_id, pages = analyzed.pages.len(), chars = text.len(), "Extracted text");

        Ok(Value::String(text))
    }
}
