//! wabot-core: shared foundation for the wabot gateway
//!
//! Provides configuration loading, the core error type, and the optional
//! completion backend client used by the message processor.

pub mod config;
pub mod error;
pub mod llm;

pub use config::{Config, LlmConfig, RetentionConfig, ServerConfig, WhatsAppConfig};
pub use error::{Error, Result};
pub use llm::{CompletionClient, Message, MessagesRequest, MessagesResponse};
