//! Session persistence.
//!
//! A [`Session`] (turn history plus its [`World`]) is stored as one JSON
//! blob per session id. Two stores implement [`SessionStore`]:
//!
//! - [`SqliteSessionStore`] keeps sessions in SQLite:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS sessions (
//!     session_id TEXT PRIMARY KEY,
//!     data       BLOB NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     checksum   TEXT
//! );
//! ```
//!
//!   with WAL mode, an optional CRC-32 checksum that warns on mismatch, and
//!   an LRU cache of decoded sessions in front of the table.
//! - [`MemorySessionStore`] keeps them in a map, for tests and throwaway runs.
//!
//! Both are last-write-wins. Serialising turns of one session is the
//! caller's job.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::error::{Result, TaleError};
use crate::types::SessionId;
use crate::world::World;

/// Opening narration used when a session is created without a seed.
pub const DEFAULT_SEED: &str = "You wake up in a misty forest. The air is heavy with fog. \
     In the distance, a flickering lantern glows faintly.";

// ---------------------------------------------------------------------------
// Session record
// ---------------------------------------------------------------------------

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    /// The player's action.
    Player,
    /// Generated narration.
    Ai,
}

/// One entry in a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Sequential id within the session, starting at 0 for the seed.
    pub turn_id: u64,
    /// Who produced the text.
    pub actor: Actor,
    /// The text itself.
    pub text: String,
    /// When the turn was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Everything persisted for one narrative session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session id.
    pub session_id: SessionId,
    /// Human-friendly name.
    pub session_name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Turn history, oldest first.
    pub history: Vec<Turn>,
    /// Structured world state.
    #[serde(default)]
    pub world: World,
    /// Last time facts were pushed to the graph layer.
    #[serde(default)]
    pub kg_sync_ts: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a session whose history starts with the seed narration.
    #[must_use]
    pub fn new(name: impl Into<String>, seed: Option<&str>) -> Self {
        let now = Utc::now();
        let seed = seed
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SEED);
        Self {
            session_id: SessionId::new(),
            session_name: name.into(),
            created_at: now,
            history: vec![Turn {
                turn_id: 0,
                actor: Actor::Ai,
                text: seed.to_string(),
                timestamp: now,
            }],
            world: World::new(),
            kg_sync_ts: Some(now),
        }
    }

    /// Append a turn and return its id.
    pub fn append_turn(&mut self, actor: Actor, text: impl Into<String>) -> u64 {
        let turn_id = self.history.last().map_or(1, |t| t.turn_id + 1);
        self.history.push(Turn {
            turn_id,
            actor,
            text: text.into(),
            timestamp: Utc::now(),
        });
        turn_id
    }

    /// The last `n` turns, oldest first.
    #[must_use]
    pub fn recent_turns(&self, n: usize) -> &[Turn] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Key/value storage of sessions.
pub trait SessionStore: Send + Sync {
    /// Load a session, or `None` if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the backend fails or the stored data is unreadable.
    fn load(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Save (upsert) a session.
    ///
    /// # Errors
    /// Returns an error if the backend fails.
    fn save(&self, session: &Session) -> Result<()>;

    /// Delete a session. Returns `true` if one was removed.
    ///
    /// # Errors
    /// Returns an error if the backend fails.
    fn delete(&self, id: &SessionId) -> Result<bool>;

    /// Ids of all stored sessions.
    ///
    /// # Errors
    /// Returns an error if the backend fails.
    fn list(&self) -> Result<Vec<SessionId>>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Session store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, Session>,
}

impl MemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|s| s.value().clone()))
    }

    fn save(&self, session: &Session) -> Result<()> {
        self.sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    fn delete(&self, id: &SessionId) -> Result<bool> {
        Ok(self.sessions.remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// CRC-32 checksum helper
// ---------------------------------------------------------------------------

/// CRC-32 (ISO 3309) of `data` as lowercase hex.
fn crc32_hex(data: &[u8]) -> String {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    format!("{:08x}", !crc)
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

struct SqliteInner {
    conn: Connection,
    cache: LruCache<SessionId, Session>,
}

/// Session store backed by an SQLite database file.
pub struct SqliteSessionStore {
    inner: Mutex<SqliteInner>,
    checksum_enabled: bool,
    db_path: PathBuf,
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore")
            .field("db_path", &self.db_path)
            .field("checksum_enabled", &self.checksum_enabled)
            .finish_non_exhaustive()
    }
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    data       BLOB NOT NULL,
    updated_at TEXT NOT NULL,
    checksum   TEXT
);";

impl SqliteSessionStore {
    /// Open (or create) a database at `path`.
    ///
    /// # Errors
    /// Returns [`TaleError::Database`] on SQLite failures or
    /// [`TaleError::Io`] if the parent directory cannot be created.
    pub fn open<P: AsRef<Path>>(path: P, config: &PersistenceConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&db_path, flags)?;

        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA)?;

        info!(
            path = %db_path.display(),
            wal = config.wal_mode,
            "Session store opened"
        );
        Ok(Self::with_connection(conn, config, db_path))
    }

    /// Open an in-memory database.
    ///
    /// # Errors
    /// Returns [`TaleError::Database`] on SQLite failures.
    pub fn open_in_memory(config: &PersistenceConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::with_connection(conn, config, PathBuf::from(":memory:")))
    }

    fn with_connection(conn: Connection, config: &PersistenceConfig, db_path: PathBuf) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(SqliteInner {
                conn,
                cache: LruCache::new(capacity),
            }),
            checksum_enabled: config.checksum_enabled,
            db_path,
        }
    }

    /// Path of the database file, or `:memory:`.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Number of stored sessions.
    ///
    /// # Errors
    /// Returns [`TaleError::Database`] on SQLite failures.
    pub fn session_count(&self) -> Result<usize> {
        let inner = self.inner.lock();
        let count: i64 = inner
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Drop all decoded sessions from the read cache.
    pub fn clear_cache(&self) {
        self.inner.lock().cache.clear();
    }
}

impl SessionStore for SqliteSessionStore {
    fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        let start = Instant::now();
        let mut inner = self.inner.lock();
        if let Some(session) = inner.cache.get(id) {
            return Ok(Some(session.clone()));
        }

        let row: Option<(Vec<u8>, Option<String>)> = {
            let mut stmt = inner
                .conn
                .prepare_cached("SELECT data, checksum FROM sessions WHERE session_id = ?1")?;
            stmt.query_row(params![id.to_string()], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?
        };
        let Some((data, stored_checksum)) = row else {
            return Ok(None);
        };

        if self.checksum_enabled {
            if let Some(expected) = stored_checksum {
                let actual = crc32_hex(&data);
                if expected != actual {
                    warn!(
                        session = %id,
                        expected = %expected,
                        actual = %actual,
                        "Checksum mismatch, possible save corruption"
                    );
                }
            }
        }

        let session: Session = serde_json::from_slice(&data)?;
        inner.cache.put(*id, session.clone());
        debug!(
            session = %id,
            turns = session.history.len(),
            elapsed_us = start.elapsed().as_micros(),
            "Loaded session"
        );
        Ok(Some(session))
    }

    fn save(&self, session: &Session) -> Result<()> {
        let start = Instant::now();
        let json = serde_json::to_vec(session)?;
        let checksum = self.checksum_enabled.then(|| crc32_hex(&json));
        let now = Utc::now().to_rfc3339();

        let mut inner = self.inner.lock();
        inner.conn.execute(
            "INSERT INTO sessions (session_id, data, updated_at, checksum)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at,
                checksum = excluded.checksum",
            params![session.session_id.to_string(), json, now, checksum],
        )?;
        inner.cache.put(session.session_id, session.clone());

        debug!(
            session = %session.session_id,
            turns = session.history.len(),
            bytes = json.len(),
            elapsed_us = start.elapsed().as_micros(),
            "Saved session"
        );
        Ok(())
    }

    fn delete(&self, id: &SessionId) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.cache.pop(id);
        let deleted = inner
            .conn
            .execute("DELETE FROM sessions WHERE session_id = ?1", params![id.to_string()])?;
        Ok(deleted > 0)
    }

    fn list(&self) -> Result<Vec<SessionId>> {
        let inner = self.inner.lock();
        let mut stmt = inner
            .conn
            .prepare_cached("SELECT session_id FROM sessions ORDER BY session_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            let raw = row?;
            match raw.parse::<SessionId>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(id = %raw, "Skipping row with invalid session id"),
            }
        }
        Ok(ids)
    }
}

/// Load a session or fail with [`TaleError::SessionNotFound`].
///
/// # Errors
/// Returns `SessionNotFound` if absent, or the store's own error.
pub fn require_session(store: &dyn SessionStore, id: &SessionId) -> Result<Session> {
    store.load(id)?.ok_or(TaleError::SessionNotFound(*id))
}
