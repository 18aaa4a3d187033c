//! The outbound generation call.
//!
//! [`Generator`] is the only place the router suspends. The HTTP
//! implementation targets the `generateContent` REST endpoint; tests plug in
//! scripted generators instead.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::LlmError;
use crate::pool::Credential;
use crate::types::{GenerationRequest, RawGeneration, ResponseSchema};

/// Default REST base URL.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// One call to the external generation service with one credential.
///
/// Any error is fine: the router classifies it by its message.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Run `request`, optionally forcing a structured answer shaped by `schema`.
    async fn call(
        &self,
        credential: &Credential,
        request: &GenerationRequest,
        schema: Option<&ResponseSchema>,
    ) -> Result<RawGeneration, LlmError>;
}

/// HTTP generator for the Gemini REST API.
#[derive(Debug, Clone)]
pub struct GeminiGenerator {
    http: Client,
    base_url: String,
}

impl GeminiGenerator {
    /// Create a generator against `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{model}:generateContent", self.base_url)
    }
}

impl Default for GeminiGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

/// Build the `generateContent` request body. A schema becomes the single
/// function declaration and calling is forced.
fn request_body(request: &GenerationRequest, schema: Option<&ResponseSchema>) -> Value {
    let mut body = json!({
        "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
        "generationConfig": {
            "temperature": request.temperature,
            "maxOutputTokens": request.max_output_tokens,
            "thinkingConfig": { "thinkingBudget": 0 },
        },
    });
    if let Some(schema) = schema {
        body["tools"] = json!([{ "functionDeclarations": [schema] }]);
        body["toolConfig"] = json!({
            "functionCallingConfig": { "mode": "ANY", "allowedFunctionNames": [schema.name] }
        });
    }
    body
}

/// Pull text parts and the first function-call arguments out of a response.
fn parse_response(body: &Value) -> Result<RawGeneration, LlmError> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            let reason = body
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
                .unwrap_or("no candidates");
            LlmError::ParseError(reason.to_string())
        })?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    let payload = parts
        .iter()
        .find_map(|p| p.pointer("/functionCall/args"))
        .cloned();

    Ok(RawGeneration {
        text: (!text.trim().is_empty()).then(|| text.trim().to_string()),
        payload,
    })
}

#[async_trait]
impl Generator for GeminiGenerator {
    async fn call(
        &self,
        credential: &Credential,
        request: &GenerationRequest,
        schema: Option<&ResponseSchema>,
    ) -> Result<RawGeneration, LlmError> {
        let response = self
            .http
            .post(self.endpoint(&request.model))
            .header("x-goog-api-key", credential.expose())
            .json(&request_body(request, schema))
            .timeout(request.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::http(status.as_u16(), &body));
        }

        let body: Value = response.json().await.map_err(|e| LlmError::ParseError(e.to_string()))?;
        let raw = parse_response(&body)?;
        debug!(
            model = %request.model,
            has_text = raw.text.is_some(),
            has_payload = raw.payload.is_some(),
            "Generation response parsed"
        );
        Ok(raw)
    }
}
