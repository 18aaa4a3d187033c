//! Player input filtering.
//!
//! Runs before any generation call. A rejected action never reaches the
//! model, the world or the graph.

use crate::config::SafetyConfig;
use crate::error::TaleError;

/// Result of a safety check on a player action.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyVerdict {
    /// Action passed all checks.
    Approved,
    /// Action is allowed but looks unusual.
    Flagged {
        /// Why the action was flagged.
        reason: String,
        /// Severity score (0.0 to 1.0).
        score: f32,
    },
    /// Action was rejected outright.
    Rejected {
        /// Why the action was rejected.
        reason: String,
    },
}

impl SafetyVerdict {
    /// Turn a rejection into [`TaleError::ContentRejected`].
    ///
    /// # Errors
    /// Returns an error only for [`SafetyVerdict::Rejected`].
    pub fn into_result(self) -> crate::error::Result<()> {
        match self {
            SafetyVerdict::Rejected { reason } => Err(TaleError::ContentRejected { reason }),
            SafetyVerdict::Approved | SafetyVerdict::Flagged { .. } => Ok(()),
        }
    }
}

/// Check a player action against the configured filter.
///
/// Checks, in order:
///   - Not empty
///   - Length within limit
///   - No banned term at the start of any word (so "killed" is caught but
///     "skill" is not)
///   - Ratio of special characters (flag only)
#[must_use]
pub fn check_player_action(text: &str, config: &SafetyConfig) -> SafetyVerdict {
    if text.trim().is_empty() {
        return SafetyVerdict::Rejected {
            reason: "Action is empty".to_string(),
        };
    }

    if !config.input_filter_enabled {
        return SafetyVerdict::Approved;
    }

    let length = text.chars().count();
    if length > config.max_action_length {
        return SafetyVerdict::Rejected {
            reason: format!(
                "Action too long: {length} chars (max: {})",
                config.max_action_length
            ),
        };
    }

    let lower = text.to_lowercase();
    let banned = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .find_map(|word| {
            config
                .banned_terms
                .iter()
                .find(|term| !term.is_empty() && word.starts_with(term.to_lowercase().as_str()))
        });
    if let Some(term) = banned {
        return SafetyVerdict::Rejected {
            reason: format!("Action contains banned term '{term}'"),
        };
    }

    let special_count = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace() && !",.'\"!?;:-()".contains(*c))
        .count();
    #[allow(clippy::cast_precision_loss)]
    let special_ratio = special_count as f32 / length.max(1) as f32;
    if special_ratio > 0.3 {
        return SafetyVerdict::Flagged {
            reason: "High ratio of special characters".to_string(),
            score: special_ratio,
        };
    }

    SafetyVerdict::Approved
}
