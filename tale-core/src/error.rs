//! Error types for the tale core library.

use thiserror::Error;

/// Top-level error type for all tale-core operations.
#[derive(Error, Debug)]
pub enum TaleError {
    /// A fact was missing a required field or carried an out-of-range value.
    #[error("Malformed fact: {reason}")]
    MalformedFact {
        /// What was wrong with the fact.
        reason: String,
    },

    /// A session with the given ID was not found.
    #[error("Session not found: {0}")]
    SessionNotFound(crate::SessionId),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The external graph backend rejected or failed an operation.
    #[error("Graph backend error: {0}")]
    Graph(String),

    /// The external graph backend is not reachable.
    #[error("Graph backend unavailable")]
    GraphUnavailable,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Content safety validation rejected the input.
    #[error("Content rejected: {reason}")]
    ContentRejected {
        /// Why the content was rejected.
        reason: String,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for TaleError {
    fn from(err: serde_json::Error) -> Self {
        TaleError::Serialization(err.to_string())
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, TaleError>;
