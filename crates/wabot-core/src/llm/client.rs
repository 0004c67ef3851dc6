//! Completion backend HTTP client
//!
//! Talks to an Anthropic-compatible Messages API. The bot treats this
//! backend as optional: callers must fall back to canned replies when a
//! request fails.

use reqwest::Client;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{Error, Result};

use super::types::{MessagesRequest, MessagesRequestBuilder, MessagesResponse};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Completion API client
#[derive(Debug, Clone)]
pub struct CompletionClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl CompletionClient {
    /// Create a new completion client
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(Error::Http)?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url,
        })
    }

    /// Create with a custom base URL (for testing or custom endpoints)
    pub fn with_base_url(config: &LlmConfig, base_url: String) -> Result<Self> {
        let mut client = Self::new(config)?;
        client.base_url = base_url;
        Ok(client)
    }

    /// Start building a request against the configured model
    pub fn request_builder(&self) -> MessagesRequestBuilder {
        MessagesRequestBuilder::new(&self.model)
    }

    /// Send a completion request
    pub async fn messages(&self, request: MessagesRequest) -> Result<MessagesResponse> {
        let url = format!("{}/messages", self.base_url);

        debug!("sending completion request to {}", url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::CompletionApi(format!(
                "completion request failed: {} - {}",
                status, body
            )));
        }

        Ok(response.json().await?)
    }
}
