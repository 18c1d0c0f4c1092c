//! SQLite-backed knowledge-base store.
//!
//! One logical writer per consolidation run; WAL keeps readers cheap. All
//! consolidation state (entities, relationships, patterns, audit log, change
//! events) commits atomically per run — the embedding cache is the one table
//! written outside that boundary.

mod commit;
mod entities;

pub use commit::StagedRun;

use std::collections::HashMap;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::ConvergeError;

/// Set busy_timeout on every connection handed out by the pool. Prevents
/// SQLITE_BUSY when a commit overlaps with outbox polling.
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Run lifecycle as recorded in the `runs` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Committed,
    RolledBack,
    Reversed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Committed => "committed",
            RunStatus::RolledBack => "rolled_back",
            RunStatus::Reversed => "reversed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "committed" => Some(RunStatus::Committed),
            "rolled_back" => Some(RunStatus::RolledBack),
            "reversed" => Some(RunStatus::Reversed),
            _ => None,
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    attrs TEXT NOT NULL DEFAULT '{}',
    sources TEXT NOT NULL DEFAULT '[]',
    consensus_confidence REAL NOT NULL DEFAULT 0,
    has_contradictions INTEGER NOT NULL DEFAULT 0,
    contradiction_details TEXT NOT NULL DEFAULT '[]',
    needs_review INTEGER NOT NULL DEFAULT 0,
    agreed_attributes INTEGER NOT NULL DEFAULT 0,
    is_consolidated INTEGER NOT NULL DEFAULT 0,
    consolidated_at INTEGER,
    superseded_by TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);
CREATE INDEX IF NOT EXISTS idx_entities_superseded ON entities(superseded_by);

CREATE TABLE IF NOT EXISTS relationships (
    id TEXT PRIMARY KEY,
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    rel_type TEXT NOT NULL,
    strength REAL NOT NULL,
    evidence_count INTEGER NOT NULL,
    run_id TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rel_from ON relationships(from_id);
CREATE INDEX IF NOT EXISTS idx_rel_to ON relationships(to_id);

CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    pattern_type TEXT NOT NULL,
    member_ids TEXT NOT NULL,
    frequency REAL NOT NULL,
    priority REAL NOT NULL,
    run_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    entity_kind TEXT NOT NULL,
    operation TEXT NOT NULL,
    before_snapshot TEXT NOT NULL,
    after_snapshot TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    processed INTEGER NOT NULL DEFAULT 1,
    error_message TEXT,
    reversed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_audit_run ON audit_log(run_id);

CREATE TABLE IF NOT EXISTS change_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    dispatched INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS embedding_cache (
    text_hash TEXT PRIMARY KEY,
    embedding BLOB NOT NULL,
    dims INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    status TEXT NOT NULL,
    error TEXT
);

CREATE TABLE IF NOT EXISTS converge_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) a database at the given path.
    /// Pool size defaults to 8 (1 writer + readers in WAL mode).
    pub fn open(path: &str) -> Result<Self, ConvergeError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each test gets a unique name to avoid cross-test pollution.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| ConvergeError::Internal(format!("pool: {e}")))?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);
        Ok(Self { pool })
    }

    pub(crate) fn conn(&self) -> Result<PooledConn, ConvergeError> {
        Ok(self.pool.get()?)
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        let conn = self.conn().ok()?;
        conn.query_row(
            "SELECT value FROM converge_meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .ok()
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), ConvergeError> {
        self.conn()?.execute(
            "INSERT INTO converge_meta (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    /// Record a run as started. Written outside the staged transaction so an
    /// aborted process is observable as a run that never finished.
    pub fn create_run(&self, run_id: &str) -> Result<(), ConvergeError> {
        self.conn()?.execute(
            "INSERT INTO runs (run_id, started_at, status) VALUES (?1, ?2, ?3)",
            rusqlite::params![run_id, now_ms(), RunStatus::Running.as_str()],
        )?;
        Ok(())
    }

    pub fn run_status(&self, run_id: &str) -> Result<Option<RunStatus>, ConvergeError> {
        use rusqlite::OptionalExtension;
        let conn = self.conn()?;
        let status: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE run_id = ?1", [run_id], |row| row.get(0))
            .optional()?;
        Ok(status.as_deref().and_then(RunStatus::parse))
    }

    /// Mark a run finished without committing anything — used when a run
    /// fails before commit (the staged writes were never applied).
    pub fn mark_run_rolled_back(&self, run_id: &str, error: &str) -> Result<(), ConvergeError> {
        self.conn()?.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, error = ?3 WHERE run_id = ?4",
            rusqlite::params![RunStatus::RolledBack.as_str(), now_ms(), error, run_id],
        )?;
        Ok(())
    }

    pub fn embedding_cache_get_many(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>, ConvergeError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT embedding FROM embedding_cache WHERE text_hash = ?1")?;
        let mut out = HashMap::new();
        for hash in hashes {
            let blob: Option<Vec<u8>> = {
                use rusqlite::OptionalExtension;
                stmt.query_row([hash], |row| row.get(0)).optional()?
            };
            if let Some(blob) = blob {
                out.insert(hash.clone(), crate::embed::bytes_to_embedding(&blob));
            }
        }
        Ok(out)
    }

    /// Persist freshly generated embeddings. Deliberately outside the run
    /// transaction: memoized function results stay valid across rollback.
    pub fn embedding_cache_put_many(
        &self,
        entries: &[(String, Vec<f32>)],
    ) -> Result<(), ConvergeError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO embedding_cache (text_hash, embedding, dims, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let now = now_ms();
            for (hash, vector) in entries {
                stmt.execute(rusqlite::params![
                    hash,
                    crate::embed::embedding_to_bytes(vector),
                    vector.len() as i64,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn embedding_cache_len(&self) -> Result<usize, ConvergeError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM embedding_cache", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
