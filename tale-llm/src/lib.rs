//! # Tale LLM Library
//!
//! Turns a quota-limited external text-generation service into a dependable
//! internal call:
//!   - **KeyPool**: one slot per API key, each with its own circuit breaker
//!     and concurrency cap
//!   - **RequestRouter**: least-recently-used rotation across slots under a
//!     global concurrency gate, with a canned fallback on exhaustion
//!   - **ResponseValidator**: instruction-leak detection with one retry
//!
//! # Flow
//!
//! ```text
//! prompt ─► ResponseValidator ─► RequestRouter ─► KeyPool (select, lease)
//!                 │                    │
//!                 │                    └─► Generator::call (HTTP)
//!                 └─► leaked? retry once, then local fallback turn
//! ```
//!
//! Nothing here returns an error to a turn: exhaustion and leakage surface
//! as a [`types::Degradation`] tag on an otherwise normal result.

pub mod error;
pub mod generator;
pub mod pool;
pub mod prompt;
pub mod router;
pub mod types;
pub mod validator;

pub use error::LlmError;
pub use generator::{GeminiGenerator, Generator};
pub use pool::{Credential, KeyPool, PoolConfig, SlotState};
pub use router::RequestRouter;
pub use types::{Completion, Degradation, FailureKind, GenerationOutcome, GenerationRequest, StoryTurn};
pub use validator::{ResponseValidator, ValidatedTurn, is_leaked};
