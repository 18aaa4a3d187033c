//! Knowledge graph mirror of the world.
//!
//! Every merged fact is also written to a graph store. Two stores implement
//! [`GraphStore`]:
//!
//! - [`CypherGraph`]: an external graph database reached through a
//!   [`GraphConnection`]. Nodes are merged by `(name, session_id)` and
//!   edges are created only if absent.
//! - [`JsonGraph`]: an in-process fact list per session, optionally
//!   mirrored to `<dir>/<session_id>.json`. Always available.
//!
//! [`GraphSync`] picks the backend once per call: the external store if it
//! is configured and reports itself available, otherwise the JSON store. A
//! failed external call falls back to JSON for that call only. A fact no
//! backend accepts is dropped from the graph; the world keeps it.

mod cypher;
mod json;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GraphConfig;
use crate::error::Result;
use crate::fact::{Fact, FactKind};
use crate::types::{Certainty, SessionId};

pub use cypher::{CypherGraph, GraphConnection, Row};
pub use json::JsonGraph;

/// Relationship type of a graph edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    /// Character owns item.
    Owns,
    /// Character is at location.
    InLocation,
    /// Character relates to character; the predicate is an edge property.
    HasRelationship {
        /// Relation text, e.g. `"meets"`.
        predicate: String,
    },
}

impl EdgeKind {
    /// Relationship label used by the graph database.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            EdgeKind::Owns => "OWNS",
            EdgeKind::InLocation => "IN_LOCATION",
            EdgeKind::HasRelationship { .. } => "HAS_RELATIONSHIP",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeKind::HasRelationship { predicate } => write!(f, "HAS_RELATIONSHIP({predicate})"),
            other => f.write_str(other.label()),
        }
    }
}

/// One directed edge of a session graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Source node name.
    pub from: String,
    /// Edge type.
    pub kind: EdgeKind,
    /// Target node name.
    pub to: String,
    /// Certainty recorded when the edge was first created.
    pub certainty: Certainty,
}

impl GraphEdge {
    /// Edge for a fact, or `None` for kinds the graph does not model
    /// (actions and properties).
    #[must_use]
    pub fn from_fact(fact: &Fact) -> Option<Self> {
        let kind = match fact.kind() {
            FactKind::Possession => EdgeKind::Owns,
            FactKind::Location => EdgeKind::InLocation,
            FactKind::Relationship => EdgeKind::HasRelationship {
                predicate: fact.predicate().to_string(),
            },
            FactKind::Action | FactKind::Property => return None,
        };
        Some(Self {
            from: fact.subject().to_string(),
            kind,
            to: fact.object().to_string(),
            certainty: fact.certainty(),
        })
    }
}

/// Which store served a graph call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The external graph database.
    External,
    /// The JSON fallback.
    Json,
}

/// The relationships stored for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Session the edges belong to.
    pub session_id: SessionId,
    /// Edges, de-duplicated, in a stable order.
    pub edges: Vec<GraphEdge>,
    /// Store that produced the snapshot.
    pub backend: Backend,
    /// When the snapshot was read.
    pub taken_at: DateTime<Utc>,
}

impl GraphSnapshot {
    /// An empty snapshot.
    #[must_use]
    pub fn empty(session_id: SessionId, backend: Backend) -> Self {
        Self::from_edges(session_id, backend, Vec::new())
    }

    /// Build a snapshot, sorting and de-duplicating `edges` by identity.
    #[must_use]
    pub fn from_edges(session_id: SessionId, backend: Backend, mut edges: Vec<GraphEdge>) -> Self {
        edges.sort_by(|a, b| (&a.from, &a.kind, &a.to).cmp(&(&b.from, &b.kind, &b.to)));
        edges.dedup_by(|a, b| a.from == b.from && a.kind == b.kind && a.to == b.to);
        Self {
            session_id,
            edges,
            backend,
            taken_at: Utc::now(),
        }
    }

    /// Whether the session has no edges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Items owned by `character`.
    #[must_use]
    pub fn items_of(&self, character: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Owns && e.from == character)
            .map(|e| e.to.as_str())
            .collect()
    }

    /// Locations recorded for `character`.
    #[must_use]
    pub fn locations_of(&self, character: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.kind == EdgeKind::InLocation && e.from == character)
            .map(|e| e.to.as_str())
            .collect()
    }
}

/// A store that mirrors facts as graph edges.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Which backend this is.
    fn backend(&self) -> Backend;

    /// Whether the store can take calls right now.
    fn is_available(&self) -> bool;

    /// Write a fact with merge-by-identity semantics.
    ///
    /// # Errors
    /// Returns an error if the store rejects the write.
    async fn upsert(&self, session: &SessionId, fact: &Fact) -> Result<()>;

    /// Read all edges of a session. A session with no facts is empty, not an error.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    async fn snapshot(&self, session: &SessionId) -> Result<GraphSnapshot>;

    /// Remove everything stored for a session. Returns `true` if anything was removed.
    ///
    /// # Errors
    /// Returns an error if the store rejects the delete.
    async fn delete_session(&self, session: &SessionId) -> Result<bool>;
}

/// Where an upserted fact ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Stored by the external graph database.
    External,
    /// Stored by the JSON fallback.
    Json,
    /// No backend accepted the fact.
    Dropped,
}

/// Dual-backend graph writer.
pub struct GraphSync {
    external: Option<Arc<dyn GraphStore>>,
    fallback: JsonGraph,
}

impl fmt::Debug for GraphSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphSync")
            .field("external", &self.external.as_ref().map(|e| e.is_available()))
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl GraphSync {
    /// JSON store only.
    #[must_use]
    pub fn json_only(fallback: JsonGraph) -> Self {
        Self {
            external: None,
            fallback,
        }
    }

    /// External store with JSON fallback.
    #[must_use]
    pub fn with_external(external: Arc<dyn GraphStore>, fallback: JsonGraph) -> Self {
        Self {
            external: Some(external),
            fallback,
        }
    }

    /// Build from configuration. `connection` is ignored when the configured
    /// backend is `"json"`.
    #[must_use]
    pub fn from_config(config: &GraphConfig, connection: Option<Arc<dyn GraphConnection>>) -> Self {
        let fallback = config
            .json_dir
            .as_ref()
            .map_or_else(JsonGraph::in_memory, JsonGraph::on_disk);
        match connection.filter(|_| config.wants_external()) {
            Some(conn) => Self::with_external(Arc::new(CypherGraph::new(conn)), fallback),
            None => Self::json_only(fallback),
        }
    }

    /// The backend the next call will try first.
    #[must_use]
    pub fn backend(&self) -> Backend {
        match self.live_external() {
            Some(_) => Backend::External,
            None => Backend::Json,
        }
    }

    /// The JSON fallback store.
    #[must_use]
    pub fn fallback(&self) -> &JsonGraph {
        &self.fallback
    }

    fn live_external(&self) -> Option<&Arc<dyn GraphStore>> {
        self.external.as_ref().filter(|e| e.is_available())
    }

    /// Mirror one fact into the graph layer. Never fails; see [`SyncOutcome`].
    pub async fn upsert(&self, session: &SessionId, fact: &Fact) -> SyncOutcome {
        if let Some(external) = self.live_external() {
            match external.upsert(session, fact).await {
                Ok(()) => {
                    debug!(session = %session, fact = %fact, "Fact written to graph database");
                    return SyncOutcome::External;
                }
                Err(e) => {
                    warn!(session = %session, error = %e, "Graph database write failed, using JSON graph");
                }
            }
        }
        match self.fallback.upsert(session, fact).await {
            Ok(()) => SyncOutcome::Json,
            Err(e) => {
                warn!(session = %session, fact = %fact, error = %e, "Fact dropped from graph");
                SyncOutcome::Dropped
            }
        }
    }

    /// Mirror facts in order.
    pub async fn upsert_all(&self, session: &SessionId, facts: &[Fact]) -> Vec<SyncOutcome> {
        let mut outcomes = Vec::with_capacity(facts.len());
        for fact in facts {
            outcomes.push(self.upsert(session, fact).await);
        }
        outcomes
    }

    /// Read a session's edges. Never fails; an unreadable session is empty.
    pub async fn snapshot(&self, session: &SessionId) -> GraphSnapshot {
        if let Some(external) = self.live_external() {
            match external.snapshot(session).await {
                Ok(snapshot) => return snapshot,
                Err(e) => {
                    warn!(session = %session, error = %e, "Graph database snapshot failed, using JSON graph");
                }
            }
        }
        match self.fallback.snapshot(session).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(session = %session, error = %e, "JSON graph unreadable, returning empty snapshot");
                GraphSnapshot::empty(*session, Backend::Json)
            }
        }
    }

    /// Clear a session from both backends. Returns `true` if either held data.
    pub async fn delete_session(&self, session: &SessionId) -> bool {
        let mut removed = false;
        if let Some(external) = self.live_external() {
            match external.delete_session(session).await {
                Ok(r) => removed |= r,
                Err(e) => warn!(session = %session, error = %e, "Graph database delete failed"),
            }
        }
        match self.fallback.delete_session(session).await {
            Ok(r) => removed |= r,
            Err(e) => warn!(session = %session, error = %e, "JSON graph delete failed"),
        }
        removed
    }
}
