//! `persist`: `{item_id, summary}` → output blob name.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use crate::adapters::{BlobStore, OUTPUT_CONTAINER};
use crate::domain::ActivityError;

use super::{Activity, ActivityContext};

/// Input of the persist step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistRequest {
    pub item_id: String,
    pub summary: String,
}

/// Output blob name: `{item_id}-{YYYYMMDDHHMMSS}.txt` in UTC.
///
/// Two runs for the same item within one second produce the same name;
/// the later write replaces the earlier one.
pub fn output_name(item_id: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}.txt", item_id, at.format("%Y%m%d%H%M%S"))
}

/// Writes the summary to the `output` container.
///
/// The name is stamped with the time the attempt was scheduled, so a
/// re-dispatched attempt rewrites the same blob instead of adding one.
pub struct PersistActivity {
    blobs: Arc<dyn BlobStore>,
}

impl PersistActivity {
    pub const NAME: &'static str = "persist";

    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }
}

#[async_trait]
impl Activity for PersistActivity {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self, ctx, input), fields(instance_id = %ctx.instance_id, attempt = ctx.attempt))]
    async fn execute(&self, ctx: &ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let request: PersistRequest = serde_json::from_value(input).map_err(|e| {
            ActivityError::permanent(format!("persist expects {{item_id, summary}}: {}", e))
        })?;

        let name = output_name(&request.item_id, ctx.scheduled_at);
        self.blobs
            .write(OUTPUT_CONTAINER, &name, request.summary.as_bytes())
            .await?;

        info!(item_id = %request.item_id, output = %name, "Summary written");

        Ok(Value::String(name))
    }
}
