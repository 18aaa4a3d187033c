//! # Tale Story Library
//!
//! Wires the generation layer (`tale-llm`) to the world model (`tale-core`):
//!
//! ```text
//! player action
//!      │  safety filter
//!      ▼
//! prompt (world summary + retrieved snippets + recent turns)
//!      │  ResponseValidator → RequestRouter → KeyPool
//!      ▼
//! narrative + options + facts ──► FactExtractor ──► WorldMerger ──► GraphSync
//!                                                        │
//!                                                        ▼
//!                                                  SessionStore
//! ```
//!
//! ## Modules
//!
//! - `engine`: [`StoryEngine`], one call per player turn
//! - `neo4j`: graph database connection over HTTP
//! - `retrieval`: context snippets for prompts
//! - `telemetry`: tracing subscriber setup

pub mod engine;
pub mod error;
pub mod neo4j;
pub mod retrieval;
pub mod telemetry;

pub use engine::{StoryEngine, TurnOutcome};
pub use error::StoryError;
