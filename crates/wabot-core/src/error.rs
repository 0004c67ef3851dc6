//! Error types for wabot-core

use thiserror::Error;

/// Main error type for wabot-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("completion API error: {0}")]
    CompletionApi(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for wabot-core
pub type Result<T> = std::result::Result<T, Error>;
