//! `summarize`: text → summary.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::adapters::TextGenerator;
use crate::domain::ActivityError;

use super::{expect_str, Activity, ActivityContext};

/// Sends the extracted text as a single prompt to the generator
pub struct SummarizeActivity {
    generator: Arc<dyn TextGenerator>,
}

impl SummarizeActivity {
    pub const NAME: &'static str = "summarize";

    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Activity for SummarizeActivity {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self, ctx, input), fields(instance_id = %ctx.instance_id, attempt = ctx.attempt, backend = self.generator.name()))]
    async fn execute(&self, ctx: &ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let text = expect_str(Self::NAME, &input)?;

        let summary = self.generator.complete(text).await?;

        // An empty completion is still a successful call
        if summary.is_empty() {
            warn!("Generator returned an empty summary");
        } else {
            info!(chars = summary.len(), "Generated summary");
        }

        Ok(Value::String(summary))
    }
}
