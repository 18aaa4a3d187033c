//! Request routing across the key pool.
//!
//! One call tries at most one attempt per slot, each through a distinct
//! slot. Every attempt first takes a permit from the global gate and then a
//! lease on the slot, so both the pool-wide cap and the per-slot cap hold at
//! once. Leases and permits are guards: a cancelled call gives back
//! everything it holds.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::LlmError;
use crate::generator::Generator;
use crate::pool::{KeyPool, SlotLease};
use crate::types::{Completion, FailureKind, GenerationOutcome, GenerationRequest, RawGeneration, ResponseSchema};

/// Canned continuation returned by [`RequestRouter::generate`] when no slot
/// produced text.
pub const FALLBACK_TEXT: &str = "The story continues with the wind rustling through the trees.";

/// Default cap on concurrent attempts across all slots.
pub const DEFAULT_GLOBAL_MAX_CONCURRENT: usize = 100;

/// Map an error message onto a failure kind.
///
/// Quota and limit phrases win over rate phrases, which win over a 403.
/// `rate`, `429` and `403` only count as whole words, so identifiers such as
/// `generateContent` do not read as a rate limit.
#[must_use]
pub fn classify(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    let has_word = |word: &str| lower.split(|c: char| !c.is_ascii_alphanumeric()).any(|w| w == word);
    if lower.contains("quota") || lower.contains("limit") {
        FailureKind::QuotaExceeded
    } else if has_word("429") || has_word("rate") {
        FailureKind::RateLimited
    } else if has_word("403") {
        FailureKind::Forbidden
    } else {
        FailureKind::Unknown
    }
}

/// Map a generator error onto a failure kind.
///
/// HTTP errors are judged on their body first and their status second.
/// Transport failures (connect, timeout, undecodable body) never trip a slot
/// on their own; they only add to its error streak.
#[must_use]
pub fn classify_error(err: &LlmError) -> FailureKind {
    match err {
        LlmError::Http { status, body } => match classify(body) {
            FailureKind::Unknown => match status {
                429 => FailureKind::RateLimited,
                403 => FailureKind::Forbidden,
                _ => FailureKind::Unknown,
            },
            kind => kind,
        },
        LlmError::Unavailable(_) | LlmError::Timeout(_) | LlmError::ParseError(_) => FailureKind::Unknown,
        other => classify(&other.to_string()),
    }
}

/// Judge a raw generation. Structured calls need a payload with every
/// required field; plain calls need non-empty text.
fn judge(raw: RawGeneration, schema: Option<&ResponseSchema>) -> GenerationOutcome {
    let text = raw.text.map(|t| t.trim().to_string()).unwrap_or_default();
    match schema {
        Some(schema) => match raw.payload {
            Some(payload) => {
                let missing = schema.missing_fields(&payload);
                if missing.is_empty() {
                    GenerationOutcome::Success {
                        text,
                        payload: Some(payload),
                    }
                } else {
                    debug!(schema = %schema.name, ?missing, "Structured payload incomplete");
                    GenerationOutcome::Failure(FailureKind::Unknown)
                }
            }
            None if text.is_empty() => GenerationOutcome::Failure(FailureKind::EmptyResponse),
            None => GenerationOutcome::Failure(FailureKind::Unknown),
        },
        None if text.is_empty() => GenerationOutcome::Failure(FailureKind::EmptyResponse),
        None => GenerationOutcome::Success {
            text,
            payload: raw.payload,
        },
    }
}

/// Routes generation calls through healthy slots.
pub struct RequestRouter {
    pool: Arc<KeyPool>,
    generator: Arc<dyn Generator>,
    gate: Semaphore,
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("slots", &self.pool.len())
            .field("gate_available", &self.gate.available_permits())
            .finish_non_exhaustive()
    }
}

impl RequestRouter {
    /// Create a router with a global concurrency cap.
    #[must_use]
    pub fn new(pool: Arc<KeyPool>, generator: Arc<dyn Generator>, global_max_concurrent: usize) -> Self {
        Self {
            pool,
            generator,
            gate: Semaphore::new(global_max_concurrent.max(1)),
        }
    }

    /// The pool this router draws from.
    #[must_use]
    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// Free permits in the global gate.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    /// Plain text generation. Never fails: exhaustion yields [`FALLBACK_TEXT`].
    pub async fn generate(&self, request: &GenerationRequest) -> String {
        match self.try_generate(request).await {
            Ok(completion) => completion.text,
            Err(err) => {
                warn!(error = %err, "Text generation exhausted, using local fallback");
                FALLBACK_TEXT.to_string()
            }
        }
    }

    /// Plain text generation that reports exhaustion.
    ///
    /// # Errors
    /// [`LlmError::Exhausted`] when no slot produced text.
    pub async fn try_generate(&self, request: &GenerationRequest) -> Result<Completion, LlmError> {
        self.rotate(request, None).await
    }

    /// Structured generation. The completion's payload carries every field
    /// `schema` requires; the caller owns the fallback.
    ///
    /// # Errors
    /// [`LlmError::Exhausted`] when no slot produced a complete payload.
    pub async fn generate_structured(
        &self,
        request: &GenerationRequest,
        schema: &ResponseSchema,
    ) -> Result<Completion, LlmError> {
        self.rotate(request, Some(schema)).await
    }

    async fn rotate(&self, request: &GenerationRequest, schema: Option<&ResponseSchema>) -> Result<Completion, LlmError> {
        let mut tried: Vec<usize> = Vec::new();
        let mut attempts = 0u32;

        for _ in 0..self.pool.len() {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| LlmError::Unavailable("generation gate closed".into()))?;

            let Some(handle) = self.pool.select_slot_excluding(&tried) else {
                debug!(tried = tried.len(), "No selectable slot left");
                break;
            };
            tried.push(handle.index());

            let Some(lease) = self.pool.acquire(&handle) else {
                debug!(slot = %handle.id(), "Slot filled up after selection, trying another");
                continue;
            };
            attempts += 1;

            match self.attempt(&lease, request, schema).await {
                GenerationOutcome::Success { text, payload } => {
                    self.pool.record_success(&handle);
                    debug!(slot = %handle.id(), attempts, "Generation succeeded");
                    return Ok(Completion {
                        text,
                        payload,
                        slot: handle.id().to_string(),
                    });
                }
                GenerationOutcome::Failure(kind) => {
                    self.pool.record_error(&handle, kind);
                    warn!(slot = %handle.id(), kind = %kind, "Generation attempt failed");
                }
            }
        }

        info!(attempts, slots = self.pool.len(), "All generation slots exhausted");
        Err(LlmError::Exhausted { attempts })
    }

    async fn attempt(
        &self,
        lease: &SlotLease<'_>,
        request: &GenerationRequest,
        schema: Option<&ResponseSchema>,
    ) -> GenerationOutcome {
        let call = self.generator.call(lease.credential(), request, schema);
        let result = match tokio::time::timeout(request.timeout, call).await {
            Ok(result) => result,
            #[allow(clippy::cast_possible_truncation)]
            Err(_) => Err(LlmError::Timeout(request.timeout.as_millis() as u64)),
        };
        match result {
            Ok(raw) => judge(raw, schema),
            Err(err) => {
                debug!(slot = %lease.handle().id(), error = %err, "Generator call failed");
                GenerationOutcome::Failure(classify_error(&err))
            }
        }
    }
}
