//! The per-turn pipeline.
//!
//! A turn runs strictly in order: input filter, prompt, generation (with
//! leak retry), fact extraction, world merge, graph sync, persistence.
//! Turns of one session are serialised by a per-session async lock; turns of
//! different sessions run concurrently and share only the key pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tale_core::config::{RouterConfig, TaleConfig};
use tale_core::extraction::{Extraction, FactExtractor};
use tale_core::fact::Fact;
use tale_core::graph::{GraphConnection, GraphSnapshot, GraphSync, SyncOutcome};
use tale_core::merge::WorldMerger;
use tale_core::metrics::{CounterSnapshot, PipelineCounters};
use tale_core::persistence::{Actor, Session, SessionStore, SqliteSessionStore, require_session};
use tale_core::safety::check_player_action;
use tale_core::{SessionId, World};
use tale_llm::generator::GeminiGenerator;
use tale_llm::pool::{KeyPool, PoolConfig, SlotMetrics};
use tale_llm::prompt::{build_extract_prompt, build_story_prompt, extract_facts_schema};
use tale_llm::router::{DEFAULT_GLOBAL_MAX_CONCURRENT, RequestRouter};
use tale_llm::types::{Degradation, GenerationRequest};
use tale_llm::validator::ResponseValidator;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StoryError};
use crate::neo4j::Neo4jHttp;
use crate::retrieval::{DEFAULT_TOP_K, RecentTurnRetriever, Retriever};

/// Turns of history included in the prompt.
pub const HISTORY_WINDOW: usize = 8;

/// What one turn produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Session the turn belongs to.
    pub session_id: SessionId,
    /// Id of the narrative turn appended to the history.
    pub turn_id: u64,
    /// Narrative shown to the player.
    pub narrative: String,
    /// Choices offered to the player.
    pub options: Vec<String>,
    /// Facts merged into the world.
    pub facts: Vec<Fact>,
    /// Structured fact records dropped as malformed.
    pub dropped_facts: usize,
    /// Whether the facts came from the heuristic extractor.
    pub heuristic: bool,
    /// Set when the narrative is a local fallback.
    pub degraded: Option<Degradation>,
}

/// Breaker and concurrency settings for the key pool.
#[must_use]
pub fn pool_config(router: &RouterConfig) -> PoolConfig {
    PoolConfig {
        max_concurrent: router.slot_max_concurrent,
        error_threshold: router.error_threshold,
        cooldown: Duration::from_secs(router.cooldown_seconds),
    }
}

/// Session orchestration over generation, world model and graph.
pub struct StoryEngine {
    config: TaleConfig,
    validator: ResponseValidator,
    extractor: FactExtractor,
    merger: WorldMerger,
    graph: GraphSync,
    store: Arc<dyn SessionStore>,
    retriever: Arc<dyn Retriever>,
    counters: PipelineCounters,
    locks: DashMap<SessionId, Arc<AsyncMutex<()>>>,
}

impl std::fmt::Debug for StoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoryEngine")
            .field("router", self.validator.router())
            .field("graph", &self.graph)
            .field("active_sessions", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl StoryEngine {
    /// Assemble an engine from parts. Uses a [`RecentTurnRetriever`].
    #[must_use]
    pub fn new(config: TaleConfig, router: Arc<RequestRouter>, store: Arc<dyn SessionStore>, graph: GraphSync) -> Self {
        let validator = ResponseValidator::with_retry_policy(
            router,
            config.validator.max_leak_retries,
            Duration::from_millis(config.validator.retry_delay_ms),
        );
        Self {
            extractor: FactExtractor::from_config(&config.extraction),
            merger: WorldMerger::new(),
            validator,
            graph,
            store,
            retriever: Arc::new(RecentTurnRetriever::default()),
            counters: PipelineCounters::new(),
            locks: DashMap::new(),
            config,
        }
    }

    /// Replace the retriever.
    #[must_use]
    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = retriever;
        self
    }

    /// Build everything from configuration: keys and graph credentials from
    /// the environment, the HTTP generator, the SQLite store and, unless
    /// disabled, a probed graph database connection.
    ///
    /// # Errors
    /// Fails only if the session database cannot be opened.
    pub async fn from_config(mut config: TaleConfig) -> Result<Self> {
        config.graph.apply_env();
        let router_config = &config.router;
        let pool = Arc::new(KeyPool::from_env(
            &router_config.key_env_vars,
            &router_config.numbered_key_prefix,
            pool_config(router_config),
        ));
        if pool.is_empty() {
            warn!("No API keys configured, every turn will use the local fallback");
        }
        let global = usize::try_from(router_config.global_max_concurrent).unwrap_or(DEFAULT_GLOBAL_MAX_CONCURRENT);
        let router = Arc::new(RequestRouter::new(
            pool,
            Arc::new(GeminiGenerator::new(router_config.base_url.as_str())),
            global,
        ));

        let store = Arc::new(SqliteSessionStore::open(&config.persistence.path, &config.persistence)?);

        let connection: Option<Arc<dyn GraphConnection>> = if config.graph.wants_external() {
            Some(Arc::new(Neo4jHttp::connect(&config.graph).await))
        } else {
            None
        };
        let graph = GraphSync::from_config(&config.graph, connection);
        info!(backend = ?graph.backend(), "Story engine ready");

        Ok(Self::new(config, router, store, graph))
    }

    fn request(&self, prompt: String) -> GenerationRequest {
        let r = &self.config.router;
        GenerationRequest::new(prompt)
            .with_model(r.model.as_str())
            .with_temperature(r.temperature)
            .with_max_output_tokens(r.max_output_tokens)
            .with_timeout(Duration::from_millis(r.request_timeout_ms))
    }

    fn session_lock(&self, id: &SessionId) -> Arc<AsyncMutex<()>> {
        self.locks.entry(*id).or_default().clone()
    }

    /// Drop the session's lock entry unless another caller holds or waits on
    /// it. Cloning out of the map needs the same shard lock `remove_if` takes,
    /// so a count of two (map plus `lock`) means nobody else has it.
    fn release_session_lock(&self, id: &SessionId, lock: &Arc<AsyncMutex<()>>) {
        self.locks
            .remove_if(id, |_, held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) == 2);
    }

    /// Sessions with a live per-session lock entry.
    #[must_use]
    pub fn locked_sessions(&self) -> usize {
        self.locks.len()
    }

    /// Start a session. The seed narration (or the default) becomes turn 0.
    ///
    /// # Errors
    /// Returns the store's error if the session cannot be saved.
    pub fn create_session(&self, name: &str, seed: Option<&str>) -> Result<Session> {
        let session = Session::new(name, seed);
        self.store.save(&session)?;
        if let Some(turn) = session.history.first() {
            self.retriever.index(&session.session_id, &turn.text);
        }
        info!(session = %session.session_id, name = %session.session_name, "Session created");
        Ok(session)
    }

    /// Run one player turn.
    ///
    /// # Errors
    /// [`StoryError::SessionNotFound`] for an unknown session,
    /// [`StoryError::Rejected`] when the action fails the input filter, or a
    /// store error. Generation problems never fail a turn.
    pub async fn take_action(&self, id: &SessionId, action: &str) -> Result<TurnOutcome> {
        let lock = self.session_lock(id);
        let outcome = {
            let _guard = lock.lock().await;
            self.run_turn(id, action).await
        };
        self.release_session_lock(id, &lock);
        outcome
    }

    async fn run_turn(&self, id: &SessionId, action: &str) -> Result<TurnOutcome> {
        let mut session = require_session(self.store.as_ref(), id)?;
        if let Err(err) = check_player_action(action, &self.config.safety).into_result() {
            PipelineCounters::incr(&self.counters.actions_rejected);
            info!(session = %id, error = %err, "Player action rejected");
            return Err(StoryError::from(err));
        }
        let action = action.trim();

        let retrieved = self.retriever.query(id, action, DEFAULT_TOP_K);
        let history: Vec<String> = session
            .recent_turns(HISTORY_WINDOW)
            .iter()
            .map(|t| t.text.clone())
            .collect();
        let prompt = build_story_prompt(&session.world.summary(), &retrieved, &history, action);

        let validated = self.validator.story_turn(&self.request(prompt)).await;
        self.count_generation(validated.leaks, validated.degraded);
        let turn = validated.turn;

        let extraction = {
            let cast: Vec<&str> = session.world.characters().keys().map(String::as_str).collect();
            if validated.degraded.is_none() {
                self.extractor
                    .resolve(Some(turn.extracted_facts.as_slice()), &turn.ai_text, &cast)
            } else {
                self.extractor.resolve(None, action, &cast)
            }
        };
        PipelineCounters::add(&self.counters.facts_dropped, extraction.dropped as u64);

        let report = self.merger.apply_facts(&mut session.world, &extraction.facts);
        PipelineCounters::add(&self.counters.facts_merged, report.applied as u64);

        let outcomes = self.graph.upsert_all(id, &extraction.facts).await;
        self.count_graph(&outcomes);
        if !outcomes.contains(&SyncOutcome::Dropped) {
            session.kg_sync_ts = Some(Utc::now());
        }

        session.append_turn(Actor::Player, action);
        let turn_id = session.append_turn(Actor::Ai, turn.ai_text.as_str());
        self.store.save(&session)?;
        self.retriever.index(id, &turn.ai_text);

        PipelineCounters::incr(&self.counters.turns);
        info!(
            session = %id,
            turn_id,
            facts = extraction.facts.len(),
            heuristic = extraction.heuristic,
            degraded = ?validated.degraded,
            "Turn complete"
        );

        Ok(TurnOutcome {
            session_id: *id,
            turn_id,
            narrative: turn.ai_text,
            options: turn.options,
            facts: extraction.facts,
            dropped_facts: extraction.dropped,
            heuristic: extraction.heuristic,
            degraded: validated.degraded,
        })
    }

    fn count_generation(&self, leaks: u32, degraded: Option<Degradation>) {
        let retries = leaks.min(self.config.validator.max_leak_retries);
        PipelineCounters::add(&self.counters.leak_retries, u64::from(retries));
        match degraded {
            Some(Degradation::Exhausted) => PipelineCounters::incr(&self.counters.exhaustion_fallbacks),
            Some(Degradation::Leaked) => PipelineCounters::incr(&self.counters.leak_fallbacks),
            None => {}
        }
    }

    fn count_graph(&self, outcomes: &[SyncOutcome]) {
        for outcome in outcomes {
            let counter = match outcome {
                SyncOutcome::External => &self.counters.graph_writes_external,
                SyncOutcome::Json => &self.counters.graph_writes_json,
                SyncOutcome::Dropped => &self.counters.graph_write_failures,
            };
            PipelineCounters::incr(counter);
        }
    }

    /// Extract facts from arbitrary text: structured extraction through the
    /// router when a slot answers, the heuristic otherwise.
    pub async fn extract_facts(&self, text: &str) -> Extraction {
        let request = self.request(build_extract_prompt(text));
        match self
            .validator
            .router()
            .generate_structured(&request, &extract_facts_schema())
            .await
        {
            Ok(completion) => {
                let records = completion
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("facts"))
                    .and_then(Value::as_array);
                match records {
                    Some(records) => self.extractor.from_structured(records),
                    None => self.extractor.resolve(None, text, &[]),
                }
            }
            Err(err) => {
                debug!(error = %err, "Structured extraction unavailable, using heuristic");
                self.extractor.resolve(None, text, &[])
            }
        }
    }

    /// Load a session.
    ///
    /// # Errors
    /// [`StoryError::SessionNotFound`] or a store error.
    pub fn session(&self, id: &SessionId) -> Result<Session> {
        Ok(require_session(self.store.as_ref(), id)?)
    }

    /// The session's current world.
    ///
    /// # Errors
    /// [`StoryError::SessionNotFound`] or a store error.
    pub fn world(&self, id: &SessionId) -> Result<World> {
        Ok(self.session(id)?.world)
    }

    /// The session's graph edges from whichever backend answers.
    pub async fn graph_snapshot(&self, id: &SessionId) -> GraphSnapshot {
        self.graph.snapshot(id).await
    }

    /// Remove a session from the store, the graph and the retriever.
    /// Returns whether the store held it.
    ///
    /// # Errors
    /// Returns the store's error.
    pub async fn delete_session(&self, id: &SessionId) -> Result<bool> {
        let lock = self.session_lock(id);
        let removed = {
            let _guard = lock.lock().await;
            let removed = self.store.delete(id)?;
            self.graph.delete_session(id).await;
            self.retriever.forget(id);
            removed
        };
        self.locks.remove(id);
        if removed {
            info!(session = %id, "Session deleted");
        }
        Ok(removed)
    }

    /// Pipeline counters.
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Per-slot key pool view.
    #[must_use]
    pub fn slot_metrics(&self) -> Vec<SlotMetrics> {
        self.validator.router().pool().metrics()
    }

    /// Graph writer in use.
    #[must_use]
    pub fn graph(&self) -> &GraphSync {
        &self.graph
    }
}
