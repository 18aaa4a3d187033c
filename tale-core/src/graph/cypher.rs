//! External graph database backend speaking Cypher.
//!
//! Nodes are `Character`, `Item` and `Location`, identified by
//! `(name, session_id)`. Writes use `MERGE` for nodes and edges, with
//! certainty and creation time set only `ON CREATE`, so writing the same
//! fact twice reuses the existing edge. Action and property facts have no
//! graph shape and are accepted without a write.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{Backend, EdgeKind, GraphEdge, GraphSnapshot, GraphStore};
use crate::error::Result;
use crate::fact::{Fact, FactKind};
use crate::types::{Certainty, SessionId};

/// One result row: column values in `RETURN` order.
pub type Row = Vec<Value>;

/// A live connection to a graph database.
///
/// Absence of a connection is normal; implementations report it through
/// [`GraphConnection::is_connected`] rather than failing at construction.
#[async_trait]
pub trait GraphConnection: Send + Sync {
    /// Whether the database answered the last health check.
    fn is_connected(&self) -> bool;

    /// Run one parameterised Cypher statement and return its rows.
    ///
    /// # Errors
    /// Returns [`crate::TaleError::Graph`] or
    /// [`crate::TaleError::GraphUnavailable`] on failure.
    async fn run(&self, query: &str, params: Value) -> Result<Vec<Row>>;
}

const MERGE_OWNS: &str = "\
MERGE (c:Character {name: $subject, session_id: $session_id})
MERGE (i:Item {name: $object, session_id: $session_id})
MERGE (c)-[r:OWNS]->(i)
ON CREATE SET r.certainty = $certainty, r.created_at = datetime()";

const MERGE_IN_LOCATION: &str = "\
MERGE (c:Character {name: $subject, session_id: $session_id})
MERGE (l:Location {name: $object, session_id: $session_id})
MERGE (c)-[r:IN_LOCATION]->(l)
ON CREATE SET r.certainty = $certainty, r.created_at = datetime()";

const MERGE_RELATIONSHIP: &str = "\
MERGE (c1:Character {name: $subject, session_id: $session_id})
MERGE (c2:Character {name: $object, session_id: $session_id})
MERGE (c1)-[r:HAS_RELATIONSHIP {type: $predicate}]->(c2)
ON CREATE SET r.certainty = $certainty, r.created_at = datetime()";

const SNAPSHOT: &str = "\
MATCH (a {session_id: $session_id})-[r]->(b {session_id: $session_id})
RETURN a.name, type(r), r.type, b.name, r.certainty";

const DELETE_SESSION: &str = "\
MATCH (n {session_id: $session_id})
DETACH DELETE n
RETURN count(*)";

/// Graph store over a [`GraphConnection`].
#[derive(Clone)]
pub struct CypherGraph {
    conn: Arc<dyn GraphConnection>,
}

impl std::fmt::Debug for CypherGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CypherGraph")
            .field("connected", &self.conn.is_connected())
            .finish()
    }
}

impl CypherGraph {
    /// Wrap a connection.
    #[must_use]
    pub fn new(conn: Arc<dyn GraphConnection>) -> Self {
        Self { conn }
    }
}

fn parse_row(row: &[Value]) -> Option<GraphEdge> {
    let from = row.first()?.as_str()?;
    let label = row.get(1)?.as_str()?;
    let to = row.get(3)?.as_str()?;
    #[allow(clippy::cast_possible_truncation)]
    let certainty = Certainty::new(row.get(4)?.as_f64()? as f32)?;
    let kind = match label {
        "OWNS" => EdgeKind::Owns,
        "IN_LOCATION" => EdgeKind::InLocation,
        "HAS_RELATIONSHIP" => EdgeKind::HasRelationship {
            predicate: row.get(2)?.as_str()?.to_string(),
        },
        _ => return None,
    };
    Some(GraphEdge {
        from: from.to_string(),
        kind,
        to: to.to_string(),
        certainty,
    })
}

#[async_trait]
impl GraphStore for CypherGraph {
    fn backend(&self) -> Backend {
        Backend::External
    }

    fn is_available(&self) -> bool {
        self.conn.is_connected()
    }

    async fn upsert(&self, session: &SessionId, fact: &Fact) -> Result<()> {
        let query = match fact.kind() {
            FactKind::Possession => MERGE_OWNS,
            FactKind::Location => MERGE_IN_LOCATION,
            FactKind::Relationship => MERGE_RELATIONSHIP,
            FactKind::Action | FactKind::Property => {
                debug!(kind = %fact.kind(), "No graph shape for fact kind, skipping");
                return Ok(());
            }
        };
        let params = json!({
            "subject": fact.subject(),
            "object": fact.object(),
            "predicate": fact.predicate(),
            "session_id": session.to_string(),
            "certainty": fact.certainty().value(),
        });
        self.conn.run(query, params).await?;
        Ok(())
    }

    async fn snapshot(&self, session: &SessionId) -> Result<GraphSnapshot> {
        let rows = self
            .conn
            .run(SNAPSHOT, json!({ "session_id": session.to_string() }))
            .await?;
        let total = rows.len();
        let edges: Vec<GraphEdge> = rows.iter().filter_map(|r| parse_row(r)).collect();
        if edges.len() < total {
            debug!(session = %session, skipped = total - edges.len(), "Skipped unreadable graph rows");
        }
        Ok(GraphSnapshot::from_edges(*session, Backend::External, edges))
    }

    async fn delete_session(&self, session: &SessionId) -> Result<bool> {
        let rows = self
            .conn
            .run(DELETE_SESSION, json!({ "session_id": session.to_string() }))
            .await?;
        let removed = rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records statements and answers with canned rows.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Value)>>,
        rows: Mutex<Vec<Row>>,
    }

    #[async_trait]
    impl GraphConnection for Recorder {
        fn is_connected(&self) -> bool {
            true
        }

        async fn run(&self, query: &str, params: Value) -> Result<Vec<Row>> {
            self.calls.lock().push((query.to_string(), params));
            Ok(self.rows.lock().clone())
        }
    }

    fn fact(kind: FactKind, s: &str, p: &str, o: &str) -> Fact {
        Fact::new(kind, s, p, o, 0.8).expect("valid fact")
    }

    #[tokio::test]
    async fn relationship_merges_with_predicate_property() {
        let conn = Arc::new(Recorder::default());
        let graph = CypherGraph::new(conn.clone());
        let session = SessionId::new();
        graph
            .upsert(&session, &fact(FactKind::Relationship, "Alice", "meets", "Bob"))
            .await
            .expect("upsert");

        let calls = conn.calls.lock();
        assert_eq!(calls.len(), 1);
        let (query, params) = &calls[0];
        assert!(query.contains("MERGE (c1)-[r:HAS_RELATIONSHIP {type: $predicate}]->(c2)"));
        assert!(query.contains("ON CREATE SET"));
        assert_eq!(params["predicate"], "meets");
        assert_eq!(params["session_id"], session.to_string());
    }

    #[tokio::test]
    async fn property_and_action_facts_are_not_written() {
        let conn = Arc::new(Recorder::default());
        let graph = CypherGraph::new(conn.clone());
        let session = SessionId::new();
        graph
            .upsert(&session, &fact(FactKind::Property, "Alice", "mood", "calm"))
            .await
            .expect("upsert");
        graph
            .upsert(&session, &fact(FactKind::Action, "Alice", "performs", "a bow"))
            .await
            .expect("upsert");
        assert!(conn.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn snapshot_parses_rows_and_skips_bad_ones() {
        let conn = Arc::new(Recorder::default());
        *conn.rows.lock() = vec![
            vec![json!("Alice"), json!("OWNS"), Value::Null, json!("key"), json!(0.6)],
            vec![json!("Alice"), json!("HAS_RELATIONSHIP"), json!("meets"), json!("Bob"), json!(0.8)],
            vec![json!("Alice"), json!("LIKES"), Value::Null, json!("tea"), json!(0.5)],
            vec![json!("Alice"), json!("IN_LOCATION"), Value::Null, json!("mill"), Value::Null],
        ];
        let graph = CypherGraph::new(conn);
        let snapshot = graph.snapshot(&SessionId::new()).await.expect("snapshot");
        assert_eq!(snapshot.edges.len(), 2);
        assert_eq!(snapshot.items_of("Alice"), vec!["key"]);
        assert_eq!(snapshot.backend, Backend::External);
    }

    #[tokio::test]
    async fn delete_reports_removed_count() {
        let conn = Arc::new(Recorder::default());
        *conn.rows.lock() = vec![vec![json!(3)]];
        let graph = CypherGraph::new(conn);
        assert!(graph.delete_session(&SessionId::new()).await.expect("delete"));
    }
}
