//! Instruction-leak detection for generated narrative.
//!
//! Models occasionally echo their own instructions back as story text. A
//! leaked turn is retried once with the same prompt; if the retry leaks too,
//! the turn is answered with a fixed local narrative instead.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::prompt::story_turn_schema;
use crate::router::RequestRouter;
use crate::types::{Degradation, GenerationRequest, ResponseSchema, StoryTurn};

/// Lowercase phrases that mark instruction or system text.
pub const LEAK_SIGNALS: [&str; 12] = [
    "you are an interactive storytelling ai",
    "remain consistent with",
    "avoid violence",
    "avoid explicit",
    "system:",
    "instruction:",
    "(local)",
    "(system)",
    "must remain consistent",
    "provided world facts",
    "you are a storytelling",
    "you must",
];

/// Narrative used when the model cannot produce a clean turn.
pub const LOCAL_FALLBACK_TEXT: &str = "The scene shifts around you, and time seems to pause for a moment. \
As clarity returns, you find yourself considering your next move.";

/// Choices offered with [`LOCAL_FALLBACK_TEXT`].
pub const LOCAL_FALLBACK_OPTIONS: [&str; 3] = ["Investigate the area", "Move forward cautiously", "Consider your options"];

/// Whether `text` looks like instruction content. Blank text counts as leaked.
#[must_use]
pub fn is_leaked(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    lower.is_empty() || LEAK_SIGNALS.iter().any(|signal| lower.contains(signal))
}

/// [`is_leaked`] for untyped payload fields. Anything but a string is leaked.
#[must_use]
pub fn is_leaked_value(value: &Value) -> bool {
    value.as_str().is_none_or(is_leaked)
}

/// The fixed safe turn.
#[must_use]
pub fn local_fallback_turn() -> StoryTurn {
    StoryTurn {
        ai_text: LOCAL_FALLBACK_TEXT.to_string(),
        options: LOCAL_FALLBACK_OPTIONS.iter().map(|o| (*o).to_string()).collect(),
        extracted_facts: Vec::new(),
    }
}

/// A story turn plus how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedTurn {
    /// The turn to show.
    pub turn: StoryTurn,
    /// Set when the turn is the local fallback.
    pub degraded: Option<Degradation>,
    /// Structured calls that came back leaked.
    pub leaks: u32,
    /// Slot that served the accepted turn.
    pub slot: Option<String>,
}

impl ValidatedTurn {
    fn fallback(degraded: Degradation, leaks: u32) -> Self {
        Self {
            turn: local_fallback_turn(),
            degraded: Some(degraded),
            leaks,
            slot: None,
        }
    }
}

/// Structured story generation with leak retry.
#[derive(Debug)]
pub struct ResponseValidator {
    router: Arc<RequestRouter>,
    schema: ResponseSchema,
    max_retries: u32,
    retry_delay: Duration,
}

impl ResponseValidator {
    /// One retry after 500ms, as shipped.
    #[must_use]
    pub fn new(router: Arc<RequestRouter>) -> Self {
        Self::with_retry_policy(router, 1, Duration::from_millis(500))
    }

    /// Custom retry count and delay.
    #[must_use]
    pub fn with_retry_policy(router: Arc<RequestRouter>, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            router,
            schema: story_turn_schema(),
            max_retries,
            retry_delay,
        }
    }

    /// The router used for generation.
    #[must_use]
    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// Generate a story turn. Never fails: exhaustion and repeated leakage
    /// both produce the local fallback turn, tagged in `degraded`.
    pub async fn story_turn(&self, request: &GenerationRequest) -> ValidatedTurn {
        let mut leaks = 0u32;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
                info!(attempt, "Retrying story generation after leaked output");
            }

            let completion = match self.router.generate_structured(request, &self.schema).await {
                Ok(completion) => completion,
                Err(err) => {
                    warn!(error = %err, "Story generation exhausted, using local fallback");
                    return ValidatedTurn::fallback(Degradation::Exhausted, leaks);
                }
            };

            let payload = completion.payload.unwrap_or(Value::Null);
            let ai_text = payload.get("ai_text").unwrap_or(&Value::Null);
            if is_leaked_value(ai_text) {
                leaks += 1;
                let preview: String = ai_text.as_str().unwrap_or_default().chars().take(80).collect();
                warn!(slot = %completion.slot, preview = %preview, "Generated text leaked instructions");
                continue;
            }

            if let Some(turn) = StoryTurn::from_payload(&payload) {
                return ValidatedTurn {
                    turn,
                    degraded: None,
                    leaks,
                    slot: Some(completion.slot),
                };
            }
        }

        warn!(leaks, "Retry also leaked, using local fallback");
        ValidatedTurn::fallback(Degradation::Leaked, leaks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signals_are_case_insensitive() {
        assert!(is_leaked("SYSTEM: respond in json"));
        assert!(is_leaked("You are an Interactive Storytelling AI that must remain consistent"));
        assert!(is_leaked("The elder frowns. (local) fallback"));
        assert!(is_leaked("   "));
        assert!(!is_leaked("The lantern flickers as Alice steps into the clearing."));
        assert!(!is_leaked("Mustard-yellow light spills across the system of caves."));
    }

    #[test]
    fn non_string_values_are_leaked() {
        assert!(is_leaked_value(&json!(42)));
        assert!(is_leaked_value(&Value::Null));
        assert!(is_leaked_value(&json!(["a"])));
        assert!(!is_leaked_value(&json!("Rain drums on the roof.")));
    }

    #[test]
    fn fallback_turn_is_fixed() {
        let turn = local_fallback_turn();
        assert!(!is_leaked(&turn.ai_text));
        assert_eq!(turn.options.len(), 3);
        assert!(turn.extracted_facts.is_empty());
    }
}
