//! Error types for rapport-llm.
//!
//! Only configuration errors stop a run. Item- and batch-level problems are
//! reported as [`crate::batch::FailureReason`] values inside a `BatchResult`.

use std::time::Duration;
use thiserror::Error;

use crate::concurrency::OperationId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("rate limited on {model}, next window opens in {wait_ms}ms")]
    RateLimited { model: String, wait_ms: u64 },

    #[error("provider error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Provider {
        status: Option<u16>,
        message: String,
    },

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("operation {0} was withdrawn before it started")]
    Cancelled(OperationId),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a provider failure without an HTTP status.
    pub fn provider(message: impl Into<String>) -> Self {
        Error::Provider {
            status: None,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
