//! wabot-whatsapp: WhatsApp Business Cloud API bot subsystem
//!
//! Webhook ingestion, per-user conversation state, keyword/stage-based
//! reply routing, and the outbound Graph API client with bounded retry.

pub mod bot;
pub mod client;
pub mod error;
pub mod processor;
pub mod retry;
pub mod store;
pub mod types;
pub mod webhook;

pub use bot::WhatsAppBot;
pub use client::{Button, CloudApiClient, OutboundSender};
pub use error::{Result, WhatsAppError};
pub use processor::MessageProcessor;
pub use retry::RetryPolicy;
pub use store::{ConversationStore, Stage};
pub use webhook::WebhookServer;
