//! WhatsApp Business Cloud API client
//!
//! One HTTP POST per logical send, against
//! `{api_url}/{version}/{phone_number_id}/messages`. Each call is a single
//! attempt; the webhook dispatcher owns the retry policy and decides what
//! to do with each error class.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use wabot_core::config::WhatsAppConfig;

use crate::error::{Result, WhatsAppError};

/// Provider limit for a text message body, in characters
pub const MAX_TEXT_LENGTH: usize = 4096;

/// Provider limit for reply buttons on an interactive message
pub const MAX_BUTTONS: usize = 3;

/// Provider limit for a reply button title, in characters
const MAX_BUTTON_TITLE_LENGTH: usize = 20;

/// Request timeout for Graph API calls; exceeding it is a transient error
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// A reply button on an interactive message
#[derive(Debug, Clone)]
pub struct Button {
    pub id: String,
    pub title: String,
}

impl Button {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// Outbound message delivery seam.
///
/// Implemented by [`CloudApiClient`] in production; tests substitute a
/// fake to drive the retry/apology contract without a network.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    /// Send a free-text message, returning the provider message id
    async fn send_text(&self, to: &str, body: &str) -> Result<String>;

    /// Send a pre-approved template (first contact / opt-in flows)
    async fn send_template(&self, to: &str, template_name: &str, language_code: &str)
        -> Result<String>;

    /// Send an interactive message with up to [`MAX_BUTTONS`] reply buttons
    async fn send_interactive(&self, to: &str, body: &str, buttons: &[Button]) -> Result<String>;

    /// Mark an inbound message as read. Best-effort: failures are logged
    /// here and never surfaced, read receipts are not business-critical.
    async fn mark_read(&self, message_id: &str);
}

/// Response from the /messages endpoint
#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<ProviderMessageId>,
}

#[derive(Debug, Deserialize)]
struct ProviderMessageId {
    id: String,
}

/// Error envelope from the Graph API
#[derive(Debug, Deserialize)]
struct GraphErrorResponse {
    error: Option<GraphErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

/// Graph API client bound to one sending phone number
#[derive(Debug, Clone)]
pub struct CloudApiClient {
    client: Client,
    access_token: String,
    phone_number_id: String,
    api_version: String,
    base_url: String,
}

impl CloudApiClient {
    /// Create a new client from the WhatsApp configuration
    pub fn new(config: &WhatsAppConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| WhatsAppError::Config(e.to_string()))?;

        Ok(Self {
            client,
            access_token: config.access_token.clone(),
            phone_number_id: config.phone_number_id.clone(),
            api_version: config.api_version.clone(),
            base_url: config.api_url.clone(),
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.base_url, self.api_version, self.phone_number_id
        )
    }

    /// POST one message payload and extract the provider message id
    async fn post_payload(&self, payload: &serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: SendResponse = response.json().await?;
            return body
                .messages
                .into_iter()
                .next()
                .map(|m| m.id)
                .ok_or_else(|| WhatsAppError::Rejected {
                    status: status.as_u16(),
                    message: "response missing message id".to_string(),
                });
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.text().await.unwrap_or_default();

        Err(classify_failure(status.as_u16(), retry_after, &body))
    }
}

/// Map an HTTP failure to the error taxonomy the dispatcher retries on
fn classify_failure(status: u16, retry_after: Option<u64>, body: &str) -> WhatsAppError {
    let message = serde_json::from_str::<GraphErrorResponse>(body)
        .ok()
        .and_then(|e| e.error)
        .map(|d| match d.code {
            Some(code) => format!("{} (code {})", d.message, code),
            None => d.message,
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        401 | 403 => WhatsAppError::Auth(message),
        429 => WhatsAppError::RateLimited { retry_after },
        408 => WhatsAppError::Transient(format!("provider timeout: {}", message)),
        s if s >= 500 => WhatsAppError::Transient(format!("provider {}: {}", s, message)),
        s => WhatsAppError::Rejected { status: s, message },
    }
}

#[async_trait]
impl OutboundSender for CloudApiClient {
    async fn send_text(&self, to: &str, body: &str) -> Result<String> {
        if to.is_empty() {
            return Err(WhatsAppError::Validation("recipient is empty".to_string()));
        }
        if body.is_empty() {
            return Err(WhatsAppError::Validation("text body is empty".to_string()));
        }
        if body.chars().count() > MAX_TEXT_LENGTH {
            return Err(WhatsAppError::Validation(format!(
                "text body exceeds {} chars, caller must truncate or segment",
                MAX_TEXT_LENGTH
            )));
        }

        info!(to, "sending text message");
        self.post_payload(&json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": body }
        }))
        .await
    }

    async fn send_template(
        &self,
        to: &str,
        template_name: &str,
        language_code: &str,
    ) -> Result<String> {
        if to.is_empty() {
            return Err(WhatsAppError::Validation("recipient is empty".to_string()));
        }
        if template_name.is_empty() {
            return Err(WhatsAppError::Validation(
                "template name is empty".to_string(),
            ));
        }

        info!(to, template_name, "sending template message");
        self.post_payload(&json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "template",
            "template": {
                "name": template_name,
                "language": { "code": language_code }
            }
        }))
        .await
    }

    async fn send_interactive(&self, to: &str, body: &str, buttons: &[Button]) -> Result<String> {
        if to.is_empty() {
            return Err(WhatsAppError::Validation("recipient is empty".to_string()));
        }
        if buttons.is_empty() || buttons.len() > MAX_BUTTONS {
            return Err(WhatsAppError::Validation(format!(
                "interactive message needs 1 to {} buttons, got {}",
                MAX_BUTTONS,
                buttons.len()
            )));
        }
        for button in buttons {
            if button.title.chars().count() > MAX_BUTTON_TITLE_LENGTH {
                return Err(WhatsAppError::Validation(format!(
                    "button title '{}' exceeds {} chars",
                    button.title, MAX_BUTTON_TITLE_LENGTH
                )));
            }
        }

        let rendered: Vec<_> = buttons
            .iter()
            .map(|b| {
                json!({
                    "type": "reply",
                    "reply": { "id": b.id, "title": b.title }
                })
            })
            .collect();

        info!(to, buttons = buttons.len(), "sending interactive message");
        self.post_payload(&json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "interactive",
            "interactive": {
                "type": "button",
                "body": { "text": body },
                "action": { "buttons": rendered }
            }
        }))
        .await
    }

    async fn mark_read(&self, message_id: &str) {
        let payload = json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id
        });

        let result = self
            .client
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(message_id, "marked message read");
            }
            Ok(response) => {
                warn!(message_id, status = %response.status(), "mark-read rejected");
            }
            Err(e) => {
                warn!(message_id, error = %e, "mark-read failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> CloudApiClient {
        CloudApiClient::new(&WhatsAppConfig {
            access_token: "EAAG_test".to_string(),
            phone_number_id: "123456".to_string(),
            verify_token: "verify".to_string(),
            api_version: "v21.0".to_string(),
            app_secret: None,
            api_url: "https://graph.facebook.com".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_messages_url() {
        assert_eq!(
            test_client().messages_url(),
            "https://graph.facebook.com/v21.0/123456/messages"
        );
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_network() {
        let client = test_client();
        let body = "a".repeat(MAX_TEXT_LENGTH + 1);
        let err = client.send_text("5215550001111", &body).await.unwrap_err();
        assert!(matches!(err, WhatsAppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_empty_recipient_rejected() {
        let client = test_client();
        let err = client.send_text("", "hola").await.unwrap_err();
        assert!(matches!(err, WhatsAppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_template_name_required() {
        let client = test_client();
        let err = client
            .send_template("5215550001111", "", "es_MX")
            .await
            .unwrap_err();
        assert!(matches!(err, WhatsAppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_button_count_limit() {
        let client = test_client();
        let buttons: Vec<Button> = (0..4)
            .map(|i| Button::new(format!("b{i}"), format!("Opción {i}")))
            .collect();
        let err = client
            .send_interactive("5215550001111", "Elige una opción", &buttons)
            .await
            .unwrap_err();
        assert!(matches!(err, WhatsAppError::Validation(_)));
    }

    #[test]
    fn test_classify_failure_taxonomy() {
        assert!(matches!(
            classify_failure(401, None, "{}"),
            WhatsAppError::Auth(_)
        ));
        assert!(matches!(
            classify_failure(429, Some(30), ""),
            WhatsAppError::RateLimited {
                retry_after: Some(30)
            }
        ));
        assert!(matches!(
            classify_failure(503, None, "upstream down"),
            WhatsAppError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(400, None, "{}"),
            WhatsAppError::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn test_classify_failure_surfaces_graph_error_message() {
        let body = r#"{"error":{"message":"(#131030) Recipient phone number not in allowed list","code":131030}}"#;
        match classify_failure(400, None, body) {
            WhatsAppError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("131030"));
            }
            other => panic!("unexpected class: {other:?}"),
        }
    }
}
