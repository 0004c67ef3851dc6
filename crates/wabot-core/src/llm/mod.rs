//! Completion backend integration

pub mod client;
pub mod types;

pub use client::CompletionClient;
pub use types::{ContentBlock, Message, MessagesRequest, MessagesRequestBuilder, MessagesResponse};
