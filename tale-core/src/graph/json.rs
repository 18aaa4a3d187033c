//! JSON fallback graph.
//!
//! Facts are kept per session in a concurrent map. With a directory
//! configured, each session is also written to `<dir>/<session_id>.json` as
//! `{"facts": [...]}`, replaced atomically (write to `.tmp`, then rename).
//! File I/O never runs under a map guard.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Backend, GraphEdge, GraphSnapshot, GraphStore};
use crate::error::Result;
use crate::fact::Fact;
use crate::types::SessionId;

#[derive(Debug, Default, Serialize, Deserialize)]
struct GraphFile {
    #[serde(default)]
    facts: Vec<Value>,
}

/// In-process fact graph with optional on-disk mirror.
#[derive(Debug, Default)]
pub struct JsonGraph {
    sessions: DashMap<SessionId, Vec<Fact>>,
    writers: DashMap<SessionId, Arc<Mutex<()>>>,
    dir: Option<PathBuf>,
}

impl JsonGraph {
    /// Keep facts in memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Keep facts in memory and mirror each session to a file under `dir`.
    #[must_use]
    pub fn on_disk(dir: impl AsRef<Path>) -> Self {
        Self {
            sessions: DashMap::new(),
            writers: DashMap::new(),
            dir: Some(dir.as_ref().to_path_buf()),
        }
    }

    /// Directory of the on-disk mirror, if any.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// All facts stored for a session, including kinds that have no edge.
    ///
    /// # Errors
    /// Returns an error if the session file exists but cannot be read.
    pub fn facts(&self, session: &SessionId) -> Result<Vec<Fact>> {
        if let Some(facts) = self.sessions.get(session) {
            return Ok(facts.value().clone());
        }
        let loaded = self.read_file(session)?;
        if !loaded.is_empty() {
            self.sessions.entry(*session).or_insert_with(|| loaded.clone());
        }
        Ok(loaded)
    }

    fn path(&self, session: &SessionId) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{session}.json")))
    }

    fn read_file(&self, session: &SessionId) -> Result<Vec<Fact>> {
        let Some(path) = self.path(session).filter(|p| p.exists()) else {
            return Ok(Vec::new());
        };
        let raw = std::fs::read(&path)?;
        let file: GraphFile = serde_json::from_slice(&raw)?;
        let total = file.facts.len();
        let facts: Vec<Fact> = file
            .facts
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        if facts.len() < total {
            debug!(session = %session, skipped = total - facts.len(), "Skipped unreadable graph facts");
        }
        Ok(facts)
    }

    fn write_file(&self, session: &SessionId, facts: &[Fact]) -> Result<()> {
        let Some(path) = self.path(session) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = GraphFile {
            facts: facts.iter().map(serde_json::to_value).collect::<std::result::Result<_, _>>()?,
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Mirror the session's current facts to disk. Writers for one session
    /// queue on its lock and each writes the latest list, so a slow writer
    /// never puts back an older file.
    fn persist(&self, session: &SessionId) -> Result<()> {
        if self.dir.is_none() {
            return Ok(());
        }
        let lock = self.writers.entry(*session).or_default().clone();
        let _guard = lock.lock();
        let facts = self.sessions.get(session).map(|e| e.value().clone()).unwrap_or_default();
        self.write_file(session, &facts)
    }
}

#[async_trait]
impl GraphStore for JsonGraph {
    fn backend(&self) -> Backend {
        Backend::Json
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn upsert(&self, session: &SessionId, fact: &Fact) -> Result<()> {
        let loaded = if self.sessions.contains_key(session) {
            Vec::new()
        } else {
            self.read_file(session)?
        };
        {
            let mut entry = self.sessions.entry(*session).or_insert(loaded);
            if entry.contains(fact) {
                return Ok(());
            }
            entry.push(fact.clone());
        }
        if let Err(e) = self.persist(session) {
            if let Some(mut facts) = self.sessions.get_mut(session) {
                if let Some(pos) = facts.iter().rposition(|f| f == fact) {
                    facts.remove(pos);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn snapshot(&self, session: &SessionId) -> Result<GraphSnapshot> {
        let edges = self.facts(session)?.iter().filter_map(GraphEdge::from_fact).collect();
        Ok(GraphSnapshot::from_edges(*session, Backend::Json, edges))
    }

    async fn delete_session(&self, session: &SessionId) -> Result<bool> {
        let mut removed = self.sessions.remove(session).is_some();
        self.writers.remove(session);
        if let Some(path) = self.path(session).filter(|p| p.exists()) {
            std::fs::remove_file(path)?;
            removed = true;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactKind;
    use crate::graph::EdgeKind;

    fn fact(kind: FactKind, s: &str, p: &str, o: &str, c: f32) -> Fact {
        Fact::new(kind, s, p, o, c).expect("valid fact")
    }

    #[tokio::test]
    async fn exact_duplicates_are_stored_once() {
        let graph = JsonGraph::in_memory();
        let session = SessionId::new();
        let f = fact(FactKind::Possession, "Alice", "acquires", "key", 0.6);
        graph.upsert(&session, &f).await.expect("upsert");
        graph.upsert(&session, &f).await.expect("upsert");
        assert_eq!(graph.facts(&session).expect("facts").len(), 1);

        // Same identity, different certainty: a distinct record, one edge.
        graph
            .upsert(&session, &fact(FactKind::Possession, "Alice", "acquires", "key", 0.9))
            .await
            .expect("upsert");
        assert_eq!(graph.facts(&session).expect("facts").len(), 2);
        assert_eq!(graph.snapshot(&session).await.expect("snapshot").edges.len(), 1);
    }

    #[tokio::test]
    async fn property_facts_are_stored_but_have_no_edge() {
        let graph = JsonGraph::in_memory();
        let session = SessionId::new();
        graph
            .upsert(&session, &fact(FactKind::Property, "Alice", "mood", "calm", 0.7))
            .await
            .expect("upsert");
        assert_eq!(graph.facts(&session).expect("facts").len(), 1);
        assert!(graph.snapshot(&session).await.expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn failed_write_is_rolled_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let not_a_dir = dir.path().join("graph");
        std::fs::write(&not_a_dir, b"occupied").expect("write");
        let graph = JsonGraph::on_disk(&not_a_dir);
        let session = SessionId::new();

        let f = fact(FactKind::Possession, "Alice", "acquires", "key", 0.6);
        assert!(graph.upsert(&session, &f).await.is_err());
        assert!(graph.facts(&session).expect("facts").is_empty());

        // The session's entry is free again for the next writer.
        assert!(graph.upsert(&session, &f).await.is_err());
        assert!(graph.sessions.get_mut(&session).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_leave_a_complete_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let graph = Arc::new(JsonGraph::on_disk(dir.path()));
        let session = SessionId::new();

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let graph = Arc::clone(&graph);
                tokio::spawn(async move {
                    let f = Fact::new(FactKind::Possession, format!("Hero{i}"), "acquires", "coin", 0.6)
                        .expect("valid fact");
                    graph.upsert(&session, &f).await
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("upsert");
        }

        let reopened = JsonGraph::on_disk(dir.path());
        assert_eq!(reopened.facts(&session).expect("facts").len(), 16);
    }

    #[tokio::test]
    async fn on_disk_mirror_survives_a_new_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = SessionId::new();
        {
            let graph = JsonGraph::on_disk(dir.path());
            graph
                .upsert(&session, &fact(FactKind::Relationship, "Alice", "meets", "Bob", 0.8))
                .await
                .expect("upsert");
        }
        let path = dir.path().join(format!("{session}.json"));
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(raw["facts"][0]["type"], "relationship");
        assert!(!dir.path().join(format!("{session}.json.tmp")).exists());

        let reopened = JsonGraph::on_disk(dir.path());
        let snapshot = reopened.snapshot(&session).await.expect("snapshot");
        assert_eq!(
            snapshot.edges[0].kind,
            EdgeKind::HasRelationship {
                predicate: "meets".into()
            }
        );
        assert!(reopened.delete_session(&session).await.expect("delete"));
        assert!(!path.exists());
    }
}
