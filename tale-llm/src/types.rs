//! Core types for generation requests and outcomes.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default model identifier.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// A request to the generation service.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    /// Full prompt text.
    pub prompt: String,
    /// Model identifier.
    pub model: String,
    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_output_tokens: u32,
    /// Per-attempt timeout.
    #[serde(skip)]
    pub timeout: Duration,
}

impl GenerationRequest {
    /// Create a request with default model settings.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.8,
            max_output_tokens: 500,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the output token cap.
    #[must_use]
    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Why one generation attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// HTTP 429 or a rate message.
    RateLimited,
    /// Quota or limit message.
    QuotaExceeded,
    /// HTTP 403.
    Forbidden,
    /// The call succeeded but produced nothing usable.
    EmptyResponse,
    /// Anything else, including a missing structured payload.
    Unknown,
}

impl FailureKind {
    /// Whether this failure opens the slot's circuit immediately.
    #[must_use]
    pub fn trips_immediately(self) -> bool {
        matches!(self, FailureKind::RateLimited | FailureKind::QuotaExceeded)
    }

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::Forbidden => "forbidden",
            FailureKind::EmptyResponse => "empty_response",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single attempt against one slot.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// The service produced usable output.
    Success {
        /// Generated text (may be empty when only a payload came back).
        text: String,
        /// Structured payload, when a schema was requested.
        payload: Option<Value>,
    },
    /// The attempt failed.
    Failure(FailureKind),
}

impl GenerationOutcome {
    /// Whether this is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, GenerationOutcome::Success { .. })
    }
}

/// What a [`crate::generator::Generator`] hands back before validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawGeneration {
    /// Concatenated text parts, if any.
    pub text: Option<String>,
    /// Function-call arguments, if any.
    pub payload: Option<Value>,
}

impl RawGeneration {
    /// Plain text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            payload: None,
        }
    }

    /// Structured result.
    #[must_use]
    pub fn payload(payload: Value) -> Self {
        Self {
            text: None,
            payload: Some(payload),
        }
    }
}

/// A function-declaration style response schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseSchema {
    /// Function name.
    pub name: String,
    /// What the function produces.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

impl ResponseSchema {
    /// Top-level fields the payload must contain.
    #[must_use]
    pub fn required_fields(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Required fields absent from `payload`. A non-object payload is
    /// missing all of them.
    #[must_use]
    pub fn missing_fields(&self, payload: &Value) -> Vec<String> {
        let object = payload.as_object();
        self.required_fields()
            .into_iter()
            .filter(|field| object.is_none_or(|o| !o.contains_key(*field)))
            .map(str::to_string)
            .collect()
    }
}

/// A successful routed generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Structured payload, present whenever a schema was requested.
    pub payload: Option<Value>,
    /// Which slot served the request.
    pub slot: String,
}

/// Why a turn was answered by a local fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    /// No slot produced a result.
    Exhausted,
    /// The model kept echoing instruction text.
    Leaked,
}

/// One narrative turn as returned by the story schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryTurn {
    /// Narrative continuation.
    pub ai_text: String,
    /// Player choices.
    #[serde(default)]
    pub options: Vec<String>,
    /// Raw fact records, validated later by the fact extractor.
    #[serde(default)]
    pub extracted_facts: Vec<Value>,
}

impl StoryTurn {
    /// Read a turn from a structured payload, tolerating stray option and
    /// fact entries of the wrong type. Returns `None` when `ai_text` is not
    /// a string.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let ai_text = payload.get("ai_text")?.as_str()?.trim().to_string();
        let options = payload
            .get("options")
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let extracted_facts = payload
            .get("extracted_facts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Some(Self {
            ai_text,
            options,
            extracted_facts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ResponseSchema {
        ResponseSchema {
            name: "t".into(),
            description: String::new(),
            parameters: json!({"type": "object", "required": ["a", "b"]}),
        }
    }

    #[test]
    fn missing_fields_lists_absent_keys() {
        assert_eq!(schema().missing_fields(&json!({"a": 1})), vec!["b".to_string()]);
        assert!(schema().missing_fields(&json!({"a": 1, "b": null})).is_empty());
        assert_eq!(schema().missing_fields(&json!("text")).len(), 2);
    }

    #[test]
    fn story_turn_from_payload_skips_junk_options() {
        let turn = StoryTurn::from_payload(&json!({
            "ai_text": "  The door creaks.  ",
            "options": ["Open it", 3, "", "Leave"],
            "extracted_facts": [{"type": "location"}],
        }))
        .expect("turn");
        assert_eq!(turn.ai_text, "The door creaks.");
        assert_eq!(turn.options, vec!["Open it", "Leave"]);
        assert_eq!(turn.extracted_facts.len(), 1);

        assert!(StoryTurn::from_payload(&json!({"ai_text": 7})).is_none());
    }

    #[test]
    fn only_rate_and_quota_trip_immediately() {
        assert!(FailureKind::RateLimited.trips_immediately());
        assert!(FailureKind::QuotaExceeded.trips_immediately());
        assert!(!FailureKind::Forbidden.trips_immediately());
        assert!(!FailureKind::Unknown.trips_immediately());
    }
}
