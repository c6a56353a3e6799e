//! Azure OpenAI chat-completions adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use crate::config::GenerationSettings;
use crate::domain::ActivityError;

use super::{status_error, transport_error};

const SERVICE: &str = "text generation";

/// API version used by the deployment listing health check
const HEALTH_API_VERSION: &str = "2023-05-15";

/// Completes a prompt with generated text
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Generate a completion. A response without content yields `""`.
    async fn complete(&self, prompt: &str) -> Result<String, ActivityError>;

    /// Verify the backend is reachable and the credentials work
    async fn health_check(&self) -> Result<()>;
}

/// Chat-completions client for one Azure OpenAI deployment
pub struct AzureOpenAiClient {
    endpoint: String,
    key: String,
    deployment: String,
    api_version: String,
    max_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl AzureOpenAiClient {
    pub fn new(
        endpoint: impl Into<String>,
        key: impl Into<String>,
        deployment: impl Into<String>,
    ) -> Self {
        let defaults = GenerationSettings::default();
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            key: key.into(),
            deployment: deployment.into(),
            api_version: defaults.api_version,
            max_tokens: defaults.max_tokens,
            client: reqwest::Client::new(),
        }
    }

    /// Create from settings; endpoint, key and deployment are required
    pub fn from_settings(settings: &GenerationSettings) -> Result<Self> {
        let endpoint = settings
            .endpoint
            .as_deref()
            .context("AZURE_OPENAI_ENDPOINT is not configured")?;
        let key = settings
            .key
            .as_deref()
            .context("AZURE_OPENAI_KEY is not configured")?;
        let deployment = settings
            .deployment
            .as_deref()
            .context("AZURE_OPENAI_DEPLOYMENT_NAME is not configured")?;

        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key: key.to_string(),
            deployment: deployment.to_string(),
            api_version: settings.api_version.clone(),
            max_tokens: settings.max_tokens,
            client,
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }

    fn deployments_url(&self) -> String {
        format!(
            "{}/openai/deployments?api-version={}",
            self.endpoint, HEALTH_API_VERSION
        )
    }
}

#[async_trait]
impl TextGenerator for AzureOpenAiClient {
    fn name(&self) -> &str {
        "azure-openai"
    }

    #[instrument(skip(self, prompt), fields(deployment = %self.deployment, prompt_len = prompt.len()))]
    async fn complete(&self, prompt: &str) -> Result<String, ActivityError> {
        let response = self
            .client
            .post(self.completions_url())
            .header("api-key", &self.key)
            .json(&serde_json::json!({
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": self.max_tokens,
            }))
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        if !response.status().is_success() {
            return Err(status_error(SERVICE, response).await);
        }

        let body: ChatResponse = response.json().await.map_err(|e| {
            ActivityError::permanent(format!("{} returned a malformed response: {}", SERVICE, e))
        })?;

        let choice = body.choices.into_iter().next().ok_or_else(|| {
            ActivityError::permanent(format!("{} response has no choices", SERVICE))
        })?;

        Ok(choice.message.content.unwrap_or_default())
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(self.deployments_url())
            .header("api-key", &self.key)
            .send()
            .await
            .context("Failed to reach Azure OpenAI endpoint")?;

        if !response.status().is_success() {
            anyhow::bail!("Azure OpenAI health check returned {}", response.status());
        }

        Ok(())
    }
}
