//! Generation error types.

use thiserror::Error;

/// Errors that can occur while talking to the generation service.
///
/// The router classifies these into a [`crate::types::FailureKind`]: HTTP
/// errors by status and body, transport errors as unknown, the rest by their
/// `Display` text.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request failed before a response arrived.
    #[error("generation request failed: {0}")]
    RequestFailed(String),

    /// The service answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// Response body was not the JSON shape we expected.
    #[error("failed to parse generation response: {0}")]
    ParseError(String),

    /// Request timed out.
    #[error("generation request timed out after {0}ms")]
    Timeout(u64),

    /// The service or the local concurrency gate is unavailable.
    #[error("generation service unavailable: {0}")]
    Unavailable(String),

    /// Every slot was tried (or none was available) without a usable result.
    #[error("all {attempts} generation attempts exhausted")]
    Exhausted {
        /// Number of distinct slots attempted.
        attempts: u32,
    },

    /// Configuration error.
    #[error("generation configuration error: {0}")]
    ConfigError(String),
}

/// Longest response body kept in [`LlmError::Http`].
const MAX_BODY_CHARS: usize = 512;

impl LlmError {
    /// Build an HTTP error, truncating long bodies.
    #[must_use]
    pub fn http(status: u16, body: &str) -> Self {
        LlmError::Http {
            status,
            body: body.chars().take(MAX_BODY_CHARS).collect(),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        // The URL carries the model path, which says nothing about the failure.
        let err = err.without_url();
        if err.is_timeout() {
            LlmError::Timeout(0)
        } else if err.is_connect() {
            LlmError::Unavailable(err.to_string())
        } else if let Some(status) = err.status() {
            LlmError::http(status.as_u16(), &err.to_string())
        } else {
            LlmError::RequestFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::ParseError(err.to_string())
    }
}
