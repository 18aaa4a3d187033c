//! Turn pipeline errors.
//!
//! Degraded generation and graph fallbacks are not errors; they show up on
//! the [`crate::engine::TurnOutcome`]. What remains here aborts a turn.

use tale_core::{SessionId, TaleError};
use thiserror::Error;

/// Errors surfaced by [`crate::engine::StoryEngine`].
#[derive(Debug, Error)]
pub enum StoryError {
    /// The player action failed the input filter.
    #[error("action rejected: {reason}")]
    Rejected {
        /// Why.
        reason: String,
    },

    /// No session with this id.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Session store or other core failure.
    #[error(transparent)]
    Core(TaleError),
}

impl From<TaleError> for StoryError {
    fn from(err: TaleError) -> Self {
        match err {
            TaleError::ContentRejected { reason } => StoryError::Rejected { reason },
            TaleError::SessionNotFound(id) => StoryError::SessionNotFound(id),
            other => StoryError::Core(other),
        }
    }
}

/// Result alias for the story crate.
pub type Result<T> = std::result::Result<T, StoryError>;
