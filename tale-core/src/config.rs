//! Configuration for the tale pipeline.
//!
//! Maps directly to `tale.toml`. Every section and field has a default, so
//! an empty file is a valid configuration. Credentials are never read from
//! here; they come from the environment (see `tale_llm::pool`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaleConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Key pool and request routing.
    #[serde(default)]
    pub router: RouterConfig,
    /// Leak detection and retry.
    #[serde(default)]
    pub validator: ValidatorConfig,
    /// Heuristic fact extraction.
    #[serde(default)]
    pub extraction: ExtractionConfig,
    /// Knowledge graph backends.
    #[serde(default)]
    pub graph: GraphConfig,
    /// Session persistence.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Player input filtering.
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl TaleConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `TaleError::Config` if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> crate::error::Result<Self> {
        toml::from_str(toml_str).map_err(|e| crate::TaleError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Key pool, circuit breaker and generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Model identifier passed to the generation service.
    #[serde(default = "default_model")]
    pub model: String,
    /// Base URL of the generation API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Max in-flight requests per credential slot.
    #[serde(default = "default_10")]
    pub slot_max_concurrent: u32,
    /// Consecutive non-quota errors before a slot's circuit opens.
    #[serde(default = "default_5")]
    pub error_threshold: u32,
    /// How long an open circuit stays closed to traffic, in seconds.
    #[serde(default = "default_300")]
    pub cooldown_seconds: u64,
    /// Max in-flight requests across all slots.
    #[serde(default = "default_100")]
    pub global_max_concurrent: u32,
    /// Sampling temperature.
    #[serde(default = "default_0_8")]
    pub temperature: f32,
    /// Output token cap per call.
    #[serde(default = "default_500")]
    pub max_output_tokens: u32,
    /// Hard timeout for one generation call in milliseconds.
    #[serde(default = "default_30000")]
    pub request_timeout_ms: u64,
    /// Environment variables holding one credential each.
    #[serde(default = "default_key_env_vars")]
    pub key_env_vars: Vec<String>,
    /// Prefix of numbered credential variables (`<prefix>1` .. `<prefix>9`).
    #[serde(default = "default_numbered_prefix")]
    pub numbered_key_prefix: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            slot_max_concurrent: 10,
            error_threshold: 5,
            cooldown_seconds: 300,
            global_max_concurrent: 100,
            temperature: 0.8,
            max_output_tokens: 500,
            request_timeout_ms: 30_000,
            key_env_vars: default_key_env_vars(),
            numbered_key_prefix: default_numbered_prefix(),
        }
    }
}

/// Leak detection retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Extra structured calls allowed after a leaked response.
    #[serde(default = "default_1")]
    pub max_leak_retries: u32,
    /// Pause before a leak retry, in milliseconds.
    #[serde(default = "default_500_u64")]
    pub retry_delay_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_leak_retries: 1,
            retry_delay_ms: 500,
        }
    }
}

/// Heuristic extractor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Subject used when no character is named.
    #[serde(default = "default_subject")]
    pub default_subject: String,
    /// Item nouns preferred over the first word after a trigger, in priority order.
    #[serde(default = "default_known_items")]
    pub known_items: Vec<String>,
    /// Words that mark a discovery as scenery rather than an item.
    #[serde(default = "default_environment_words")]
    pub environment_words: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            default_subject: default_subject(),
            known_items: default_known_items(),
            environment_words: default_environment_words(),
        }
    }
}

/// Knowledge graph backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// "auto" tries the graph database first; "json" never connects.
    #[serde(default = "default_auto")]
    pub backend: String,
    /// Graph database HTTP endpoint.
    #[serde(default = "default_neo4j_uri")]
    pub neo4j_uri: String,
    /// Graph database user.
    #[serde(default = "default_neo4j_user")]
    pub neo4j_user: String,
    /// Graph database password. `NEO4J_PASSWORD` overrides it, see
    /// [`GraphConfig::apply_env`].
    #[serde(default)]
    pub neo4j_password: Option<String>,
    /// Graph database name.
    #[serde(default = "default_neo4j_database")]
    pub neo4j_database: String,
    /// Directory for the JSON fallback; `None` keeps it in-process only.
    #[serde(default)]
    pub json_dir: Option<PathBuf>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            backend: default_auto(),
            neo4j_uri: default_neo4j_uri(),
            neo4j_user: default_neo4j_user(),
            neo4j_password: None,
            neo4j_database: default_neo4j_database(),
            json_dir: None,
        }
    }
}

impl GraphConfig {
    /// Whether an external graph database should be attempted at all.
    #[must_use]
    pub fn wants_external(&self) -> bool {
        !self.backend.eq_ignore_ascii_case("json")
    }

    /// Override connection settings from `NEO4J_URI`, `NEO4J_USERNAME` (or
    /// `NEO4J_USER`), `NEO4J_PASSWORD` and `NEO4J_DATABASE`.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// [`GraphConfig::apply_env`] against any variable source. Blank values
    /// are ignored. A `bolt://` or `neo4j://` URI keeps its host and moves to
    /// the HTTP port, since only the HTTP API is spoken.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(uri) = get("NEO4J_URI") {
            self.neo4j_uri = http_uri(&uri);
        }
        if let Some(user) = get("NEO4J_USERNAME").or_else(|| get("NEO4J_USER")) {
            self.neo4j_user = user;
        }
        if let Some(password) = get("NEO4J_PASSWORD") {
            self.neo4j_password = Some(password);
        }
        if let Some(database) = get("NEO4J_DATABASE") {
            self.neo4j_database = database;
        }
    }
}

fn http_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    if !["bolt", "bolt+s", "neo4j", "neo4j+s"].contains(&scheme) {
        return uri.to_string();
    }
    let host_port = rest.split('/').next().unwrap_or(rest);
    let host = host_port.rsplit_once(':').map_or(host_port, |(host, _)| host);
    let http = if scheme.ends_with("+s") { "https" } else { "http" };
    format!("{http}://{host}:7474")
}

/// Session persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Use WAL mode for concurrent reads.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// Detect save corruption via checksums.
    #[serde(default = "default_true")]
    pub checksum_enabled: bool,
    /// Sessions kept decoded in memory.
    #[serde(default = "default_64")]
    pub cache_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            wal_mode: true,
            checksum_enabled: true,
            cache_capacity: 64,
        }
    }
}

/// Player input filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Whether to filter player actions at all.
    #[serde(default = "default_true")]
    pub input_filter_enabled: bool,
    /// Lower-case terms that reject an action outright.
    #[serde(default = "default_banned_terms")]
    pub banned_terms: Vec<String>,
    /// Max character length of one player action.
    #[serde(default = "default_1000")]
    pub max_action_length: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            input_filter_enabled: true,
            banned_terms: default_banned_terms(),
            max_action_length: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_model() -> String { "gemini-2.5-flash".to_string() }
fn default_base_url() -> String { "https://generativelanguage.googleapis.com".to_string() }
fn default_subject() -> String { "Player".to_string() }
fn default_auto() -> String { "auto".to_string() }
fn default_neo4j_uri() -> String { "http://localhost:7474".to_string() }
fn default_neo4j_user() -> String { "neo4j".to_string() }
fn default_neo4j_database() -> String { "neo4j".to_string() }
fn default_numbered_prefix() -> String { "GEMINI_API_KEY_".to_string() }
fn default_db_path() -> PathBuf { PathBuf::from("data/sessions.db") }
fn default_key_env_vars() -> Vec<String> {
    vec!["GOOGLE_API_KEY".to_string(), "GEMINI_API_KEY".to_string()]
}
fn default_known_items() -> Vec<String> {
    ["lantern", "compass", "key", "sword", "book", "coin"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_environment_words() -> Vec<String> {
    ["roots", "ground", "floor", "earth", "path", "way", "direction", "route", "trail"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_banned_terms() -> Vec<String> {
    ["kill", "murder", "hate", "racist", "sexual"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_0_8() -> f32 { 0.8 }
fn default_1() -> u32 { 1 }
fn default_5() -> u32 { 5 }
fn default_10() -> u32 { 10 }
fn default_64() -> usize { 64 }
fn default_100() -> u32 { 100 }
fn default_300() -> u64 { 300 }
fn default_500() -> u32 { 500 }
fn default_500_u64() -> u64 { 500 }
fn default_1000() -> usize { 1000 }
fn default_30000() -> u64 { 30_000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = TaleConfig::from_toml("").expect("empty config");
        assert_eq!(config.router.slot_max_concurrent, 10);
        assert_eq!(config.router.error_threshold, 5);
        assert_eq!(config.router.cooldown_seconds, 300);
        assert_eq!(config.router.global_max_concurrent, 100);
        assert_eq!(config.validator.max_leak_retries, 1);
        assert_eq!(config.extraction.default_subject, "Player");
        assert!(config.graph.wants_external());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = TaleConfig::from_toml(
            r#"
            [router]
            error_threshold = 3
            cooldown_seconds = 60

            [graph]
            backend = "json"
            json_dir = "data/kg"
            "#,
        )
        .expect("parse");
        assert_eq!(config.router.error_threshold, 3);
        assert_eq!(config.router.slot_max_concurrent, 10);
        assert!(!config.graph.wants_external());
        assert_eq!(config.graph.json_dir, Some(PathBuf::from("data/kg")));
    }

    #[test]
    fn graph_environment_overrides_toml() {
        let mut graph = TaleConfig::from_toml(
            r#"
            [graph]
            neo4j_uri = "http://file-host:7474"
            neo4j_password = "from-file"
            "#,
        )
        .expect("parse")
        .graph;
        let vars = [
            ("NEO4J_URI", "bolt://graph.internal:7687"),
            ("NEO4J_USER", "storyteller"),
            ("NEO4J_PASSWORD", "from-env"),
            ("NEO4J_DATABASE", "  "),
        ];
        graph.apply_overrides(|name| vars.iter().find(|(k, _)| *k == name).map(|(_, v)| (*v).to_string()));

        assert_eq!(graph.neo4j_uri, "http://graph.internal:7474");
        assert_eq!(graph.neo4j_user, "storyteller");
        assert_eq!(graph.neo4j_password.as_deref(), Some("from-env"));
        assert_eq!(graph.neo4j_database, "neo4j", "blank values are ignored");
    }

    #[test]
    fn graph_overrides_keep_http_uris_and_prefer_username() {
        let mut graph = GraphConfig::default();
        let vars = [
            ("NEO4J_URI", "https://graph.example:7473"),
            ("NEO4J_USERNAME", "primary"),
            ("NEO4J_USER", "secondary"),
        ];
        graph.apply_overrides(|name| vars.iter().find(|(k, _)| *k == name).map(|(_, v)| (*v).to_string()));
        assert_eq!(graph.neo4j_uri, "https://graph.example:7473");
        assert_eq!(graph.neo4j_user, "primary");
        assert_eq!(graph.neo4j_password, None);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = TaleConfig::from_toml("[router\nmodel = 1").expect_err("invalid");
        assert!(matches!(err, crate::TaleError::Config(_)));
    }
}
