//! Error types for wabot-whatsapp
//!
//! The variants encode retry semantics: `RateLimited` and `Transient` may
//! be retried with backoff, everything else must not be.

use thiserror::Error;

/// wabot-whatsapp error type
#[derive(Error, Debug)]
pub enum WhatsAppError {
    /// Caller's fault (oversized body, too many buttons, empty recipient).
    /// Raised before any network call, never retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Invalid or expired access token. Fatal, never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Provider 429. Retryable with backoff.
    #[error("rate limited by provider (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    /// Timeout, connection failure, or provider 5xx. Retryable.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Provider refused this specific request (4xx other than auth).
    /// Surfaced to the caller, not retried.
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Store inconsistency, indicates a logic bug upstream.
    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl WhatsAppError {
    /// Whether the retry policy may attempt this call again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WhatsAppError::RateLimited { .. } | WhatsAppError::Transient(_)
        )
    }

    /// Short class name for structured logging
    pub fn class(&self) -> &'static str {
        match self {
            WhatsAppError::Validation(_) => "validation",
            WhatsAppError::Auth(_) => "auth",
            WhatsAppError::RateLimited { .. } => "rate_limited",
            WhatsAppError::Transient(_) => "transient",
            WhatsAppError::Rejected { .. } => "rejected",
            WhatsAppError::NotFound(_) => "not_found",
            WhatsAppError::Config(_) => "config",
        }
    }
}

impl From<reqwest::Error> for WhatsAppError {
    fn from(err: reqwest::Error) -> Self {
        // Errors without an HTTP status (timeouts, DNS, connection resets)
        // are transient by classification; status-bearing failures are
        // classified from the response in the client.
        WhatsAppError::Transient(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, WhatsAppError>;
