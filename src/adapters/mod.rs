//! Adapter interfaces for external systems.
//!
//! Activities never talk to storage or remote services directly; they go
//! through these traits so the engine can be driven by fakes in tests and
//! by the Azure-compatible REST clients in production.

pub mod blob;
pub mod clock;
pub mod layout;
pub mod openai;

pub use blob::{BlobStore, FsBlobStore, StorageError, INPUT_CONTAINER, OUTPUT_CONTAINER};
pub use clock::{Clock, FixedClock, SystemClock};
pub use layout::{AnalyzedDocument, DocumentIntelligenceClient, LayoutAnalyzer, LayoutLine, LayoutPage};
pub use openai::{AzureOpenAiClient, TextGenerator};

use crate::domain::ActivityError;

/// Classify a transport-level failure (no HTTP status received)
pub(crate) fn transport_error(service: &str, err: reqwest::Error) -> ActivityError {
    if let Some(status) = err.status() {
        return ActivityError::from_status(status.as_u16(), format!("{}: {}", service, err));
    }
    if err.is_builder() {
        return ActivityError::permanent(format!("{} request could not be built: {}", service, err));
    }
    // Timeouts, refused connections and resets are worth another attempt
    ActivityError::transient(format!("{} unreachable: {}", service, err))
}

/// Turn a non-success response into a classified failure
pub(crate) async fn status_error(service: &str, response: reqwest::Response) -> ActivityError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let detail = body.chars().take(500).collect::<String>();

    ActivityError::from_status(status, format!("{} returned {}: {}", service, status, detail))
}
