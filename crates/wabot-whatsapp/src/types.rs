//! Meta webhook payload types
//!
//! Everything is `#[serde(default)]` so partial or unrecognized payloads
//! deserialize instead of failing the whole batch; the provider retries
//! aggressively on non-2xx responses.

use serde::Deserialize;

/// Expected value of the top-level `object` field
pub const WEBHOOK_OBJECT: &str = "whatsapp_business_account";

/// Entry field carrying message events
pub const MESSAGES_FIELD: &str = "messages";

/// Top-level webhook notification from Meta
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

/// A single entry in the notification
#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

/// A change within an entry
#[derive(Debug, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: ChangeValue,
}

/// The value payload containing messages and/or delivery statuses
#[derive(Debug, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub statuses: Vec<StatusEvent>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

/// A single inbound message
#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    /// Sender wa_id (phone number)
    #[serde(default)]
    pub from: String,
    /// Provider message id
    #[serde(default)]
    pub id: String,
    /// Unix timestamp as string
    #[serde(default)]
    pub timestamp: String,
    /// "text", "image", "document", "interactive", ...
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Present only when kind == "text"
    #[serde(default)]
    pub text: Option<TextBody>,
}

/// Text content within a message
#[derive(Debug, Deserialize)]
pub struct TextBody {
    #[serde(default)]
    pub body: String,
}

/// Delivery status callback for a previously sent message
#[derive(Debug, Deserialize)]
pub struct StatusEvent {
    /// Provider message id of the outbound message
    #[serde(default)]
    pub id: String,
    /// "sent", "delivered", "read", "failed"
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub recipient_id: String,
}

/// Contact info from the webhook
#[derive(Debug, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub wa_id: String,
    #[serde(default)]
    pub profile: Option<ContactProfile>,
}

/// Profile info within a contact
#[derive(Debug, Deserialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub name: String,
}
