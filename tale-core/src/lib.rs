//! # Tale Core Library
//!
//! World model for interactive narrative sessions.
//!
//! A player turn produces narrative text; this crate turns that text (or the
//! structured facts a model returned with it) into typed [`Fact`]s, folds
//! them into a session's [`World`], and mirrors them into a knowledge graph:
//!
//! - [`extraction`]: structured fact validation and the heuristic
//!   trigger-phrase fallback
//! - [`merge`]: idempotent, monotonic [`WorldMerger`]
//! - [`graph`]: [`graph::GraphSync`] over an external graph database with a
//!   JSON fallback
//! - [`persistence`]: session records and stores
//! - [`safety`]: player input filtering
//!
//! Nothing in this crate talks to a language model; see `tale-llm`.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod extraction;
pub mod fact;
pub mod graph;
pub mod merge;
pub mod metrics;
pub mod persistence;
pub mod safety;
pub mod types;
pub mod world;

pub use config::TaleConfig;
pub use error::TaleError;
pub use extraction::{Extraction, FactExtractor};
pub use fact::{Fact, FactKind};
pub use merge::{MergeReport, WorldMerger};
pub use types::*;
pub use world::World;
