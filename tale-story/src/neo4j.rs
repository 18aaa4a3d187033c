//! Graph database connection over the Neo4j HTTP transaction API.
//!
//! Each statement is sent as its own auto-commit transaction to
//! `{uri}/db/{database}/tx/commit`. Connectivity is probed with `RETURN 1`
//! at startup and tracked afterwards: a transport failure marks the
//! connection down, any answer from the server marks it up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tale_core::config::GraphConfig;
use tale_core::error::{Result, TaleError};
use tale_core::graph::{GraphConnection, Row};
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    #[serde(default)]
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

/// HTTP connection to one Neo4j database.
#[derive(Debug)]
pub struct Neo4jHttp {
    http: Client,
    endpoint: String,
    user: String,
    password: Option<String>,
    connected: AtomicBool,
}

impl Neo4jHttp {
    /// Build a connection without contacting the server. It reports
    /// disconnected until [`Neo4jHttp::probe`] or a statement succeeds.
    #[must_use]
    pub fn new(config: &GraphConfig) -> Self {
        let endpoint = format!(
            "{}/db/{}/tx/commit",
            config.neo4j_uri.trim_end_matches('/'),
            config.neo4j_database
        );
        Self {
            http: Client::new(),
            endpoint,
            user: config.neo4j_user.clone(),
            password: config.neo4j_password.clone(),
            connected: AtomicBool::new(false),
        }
    }

    /// Build and probe. Never fails: an unreachable server just yields a
    /// disconnected handle.
    pub async fn connect(config: &GraphConfig) -> Self {
        let conn = Self::new(config);
        if conn.probe().await {
            info!(endpoint = %conn.endpoint, "Graph database reachable");
        } else {
            warn!(endpoint = %conn.endpoint, "Graph database unreachable, JSON graph will be used");
        }
        conn
    }

    /// Run `RETURN 1` and update the connectivity flag.
    pub async fn probe(&self) -> bool {
        self.execute("RETURN 1", json!({})).await.is_ok()
    }

    /// Commit endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn execute(&self, query: &str, params: Value) -> Result<Vec<Row>> {
        let body = json!({ "statements": [{ "statement": query, "parameters": params }] });
        let mut request = self.http.post(&self.endpoint).json(&body).timeout(REQUEST_TIMEOUT);
        if let Some(password) = &self.password {
            request = request.basic_auth(&self.user, Some(password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                self.connected.store(false, Ordering::Relaxed);
                debug!(error = %err, "Graph database request failed");
                return Err(TaleError::GraphUnavailable);
            }
        };
        self.connected.store(true, Ordering::Relaxed);

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TaleError::Graph(format!("HTTP {status}: {text}")));
        }
        let parsed: TxResponse = response
            .json()
            .await
            .map_err(|e| TaleError::Graph(format!("unreadable response: {e}")))?;
        if let Some(err) = parsed.errors.first() {
            return Err(TaleError::Graph(format!("{}: {}", err.code, err.message)));
        }
        Ok(parsed
            .results
            .into_iter()
            .flat_map(|r| r.data.into_iter().map(|d| d.row))
            .collect())
    }
}

#[async_trait]
impl GraphConnection for Neo4jHttp {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn run(&self, query: &str, params: Value) -> Result<Vec<Row>> {
        self.execute(query, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uses_database_name() {
        let config = GraphConfig {
            neo4j_uri: "http://graph:7474/".into(),
            neo4j_database: "stories".into(),
            ..GraphConfig::default()
        };
        assert_eq!(Neo4jHttp::new(&config).endpoint(), "http://graph:7474/db/stories/tx/commit");
    }

    #[test]
    fn starts_disconnected() {
        assert!(!Neo4jHttp::new(&GraphConfig::default()).is_connected());
    }

    #[tokio::test]
    async fn unreachable_server_stays_disconnected() {
        let config = GraphConfig {
            neo4j_uri: "http://127.0.0.1:1".into(),
            ..GraphConfig::default()
        };
        let conn = Neo4jHttp::connect(&config).await;
        assert!(!conn.is_connected());
        let err = conn.run("RETURN 1", json!({})).await.expect_err("unreachable");
        assert!(matches!(err, TaleError::GraphUnavailable));
    }

    #[test]
    fn parses_transaction_response() {
        let raw = json!({
            "results": [{ "columns": ["a"], "data": [{ "row": ["Alice", 1] }, { "row": ["Bob", 2] }] }],
            "errors": []
        });
        let parsed: TxResponse = serde_json::from_value(raw).expect("parse");
        assert_eq!(parsed.results[0].data.len(), 2);
        assert_eq!(parsed.results[0].data[1].row[0], "Bob");
    }
}
