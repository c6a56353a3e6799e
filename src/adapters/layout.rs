//! Document layout analysis.
//!
//! The REST client talks to the Document Intelligence `prebuilt-layout`
//! model: submit the document, then poll the returned operation URL
//! until analysis finishes.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::config::AnalysisSettings;
use crate::domain::ActivityError;

use super::{status_error, transport_error};

const SERVICE: &str = "layout analysis";

/// One line of recognised text
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LayoutLine {
    pub content: String,
}

/// One analysed page
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutPage {
    #[serde(default)]
    pub page_number: u32,
    #[serde(default)]
    pub lines: Vec<LayoutLine>,
}

/// Result of analysing a document
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct AnalyzedDocument {
    #[serde(default)]
    pub pages: Vec<LayoutPage>,
}

impl AnalyzedDocument {
    /// Every line of every page, in reading order, joined by newlines.
    /// Pages without lines contribute nothing.
    pub fn text(&self) -> String {
        self.pages
            .iter()
            .flat_map(|page| page.lines.iter())
            .map(|line| line.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Turns document bytes into pages of lines
#[async_trait]
pub trait LayoutAnalyzer: Send + Sync {
    async fn analyze(&self, document: Vec<u8>) -> Result<AnalyzedDocument, ActivityError>;
}

/// Document Intelligence REST client
pub struct DocumentIntelligenceClient {
    endpoint: String,
    key: String,
    model_id: String,
    api_version: String,
    locale: String,
    poll_interval: Duration,
    max_polls: u32,
    client: reqwest::Client,
}

/// Body of an analyze-result poll
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOperation {
    status: String,
    analyze_result: Option<AnalyzedDocument>,
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl DocumentIntelligenceClient {
    /// Create a client with default model settings
    pub fn new(endpoint: impl Into<String>, key: impl Into<String>) -> Self {
        let defaults = AnalysisSettings::default();
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            key: key.into(),
            model_id: defaults.model_id,
            api_version: defaults.api_version,
            locale: defaults.locale,
            poll_interval: defaults.poll_interval,
            max_polls: defaults.max_polls,
            client: reqwest::Client::new(),
        }
    }

    /// Create from settings; endpoint and key are required
    pub fn from_settings(settings: &AnalysisSettings) -> Result<Self> {
        let endpoint = settings
            .endpoint
            .as_deref()
            .context("COGNITIVE_SERVICES_ENDPOINT is not configured")?;
        let key = settings
            .key
            .as_deref()
            .context("COGNITIVE_SERVICES_KEY is not configured")?;

        let mut client = Self::new(endpoint, key);
        client.model_id = settings.model_id.clone();
        client.api_version = settings.api_version.clone();
        client.locale = settings.locale.clone();
        client.poll_interval = settings.poll_interval;
        client.max_polls = settings.max_polls;
        Ok(client)
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }

    fn analyze_url(&self) -> String {
        format!(
            "{}/formrecognizer/documentModels/{}:analyze?api-version={}&locale={}",
            self.endpoint, self.model_id, self.api_version, self.locale
        )
    }

    /// Submit the document, returning the operation URL to poll
    async fn submit(&self, document: Vec<u8>) -> Result<String, ActivityError> {
        let response = self
            .client
            .post(self.analyze_url())
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/octet-stream")
            .body(document)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        if !response.status().is_success() {
            return Err(status_error(SERVICE, response).await);
        }

        response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ActivityError::permanent(format!("{} response has no Operation-Location", SERVICE))
            })
    }

    async fn poll(&self, operation_url: &str) -> Result<AnalyzeOperation, ActivityError> {
        let response = self
            .client
            .get(operation_url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        if !response.status().is_success() {
            return Err(status_error(SERVICE, response).await);
        }

        response.json().await.map_err(|e| {
            ActivityError::permanent(format!("{} returned a malformed result: {}", SERVICE, e))
        })
    }
}

#[async_trait]
impl LayoutAnalyzer for DocumentIntelligenceClient {
    #[instrument(skip(self, document), fields(bytes = document.len(), model = %self.model_id))]
    async fn analyze(&self, document: Vec<u8>) -> Result<AnalyzedDocument, ActivityError> {
        let operation_url = self.submit(document).await?;

        for poll in 1..=self.max_polls {
            let operation = self.poll(&operation_url).await?;
            debug!(poll, status = %operation.status, "Layout analysis status");

            match operation.status.as_str() {
                "succeeded" => {
                    return Ok(operation.analyze_result.unwrap_or_default());
                }
                "failed" | "canceled" => {
                    let detail = operation
                        .error
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .unwrap_or_else(|| "no error detail".to_string());
                    return Err(ActivityError::permanent(format!(
                        "{} {}: {}",
                        SERVICE, operation.status, detail
                    )));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }

        Err(ActivityError::transient(format!(
            "{} did not finish after {} polls",
            SERVICE, self.max_polls
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ANALYZE_PATH: &str = "/formrecognizer/documentModels/prebuilt-layout:analyze";
    const RESULT_PATH: &str = "/formrecognizer/documentModels/prebuilt-layout/analyzeResults/op-1";

    fn client(server: &MockServer) -> DocumentIntelligenceClient {
        DocumentIntelligenceClient::new(server.uri(), "test-key")
            .with_polling(Duration::from_millis(10), 5)
    }

    async fn mount_submit(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(ANALYZE_PATH))
            .and(query_param("locale", "en-US"))
            .and(header("Ocp-Apim-Subscription-Key", "test-key"))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Operation-Location", format!("{}{}", server.uri(), RESULT_PATH)),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_text_joins_lines_across_pages() {
        let doc: AnalyzedDocument = serde_json::from_value(json!({
            "pages": [
                {"pageNumber": 1, "lines": [{"content": "Quarterly"}, {"content": "revenue"}]},
                {"pageNumber": 2, "lines": []},
                {"pageNumber": 3, "lines": [{"content": "rose 8%."}]}
            ]
        }))
        .unwrap();

        assert_eq!(doc.text(), "Quarterly\nrevenue\nrose 8%.");
        assert_eq!(AnalyzedDocument::default().text(), "");
    }

    #[tokio::test]
    async fn test_analyze_polls_until_succeeded() {
        let server = MockServer::start().await;
        mount_submit(&server).await;

        Mock::given(method("GET"))
            .and(path(RESULT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "running"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(RESULT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "succeeded",
                "analyzeResult": {"pages": [{"pageNumber": 1, "lines": [{"content": "hello"}]}]}
            })))
            .mount(&server)
            .await;

        let doc = client(&server).analyze(b"%PDF".to_vec()).await.unwrap();
        assert_eq!(doc.text(), "hello");
    }

    #[tokio::test]
    async fn test_rejected_document_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ANALYZE_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_string("InvalidContent"))
            .mount(&server)
            .await;

        let err = client(&server).analyze(b"junk".to_vec()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message.contains("400"));
    }

    #[tokio::test]
    async fn test_throttling_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ANALYZE_PATH))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = client(&server).analyze(b"%PDF".to_vec()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_failed_analysis_is_permanent() {
        let server = MockServer::start().await;
        mount_submit(&server).await;
        Mock::given(method("GET"))
            .and(path(RESULT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "failed",
                "error": {"code": "UnsupportedContent", "message": "not a document"}
            })))
            .mount(&server)
            .await;

        let err = client(&server).analyze(b"%PDF".to_vec()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message.contains("UnsupportedContent"));
    }

    #[tokio::test]
    async fn test_poll_limit_is_transient() {
        let server = MockServer::start().await;
        mount_submit(&server).await;
        Mock::given(method("GET"))
            .and(path(RESULT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "running"})))
            .expect(5)
            .mount(&server)
            .await;

        let err = client(&server).analyze(b"%PDF".to_vec()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_from_settings_requires_credentials() {
        assert!(DocumentIntelligenceClient::from_settings(&AnalysisSettings::default()).is_err());
    }
}
