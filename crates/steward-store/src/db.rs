//! Storage engine — the single SQLite connection every store shares.
//!
//! One process owns the database file. All writes go through one connection
//! behind a mutex, so they serialize in SQLite's own transaction machinery.
//! WAL journaling keeps the file crash consistent and foreign keys are enforced
//! so deleting a task cascades to its run history.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use steward_core::config::IN_MEMORY;
use steward_core::error::{Result, StewardError};

/// Current schema version, recorded in `schema_meta`.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS schema_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    -- TTL cache; expires_at is unix millis, NULL = never expires
    CREATE TABLE IF NOT EXISTS cache (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache (expires_at);

    -- Token locks; one row per held resource
    CREATE TABLE IF NOT EXISTS locks (
        resource_id TEXT PRIMARY KEY,
        token TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_locks_expires_at ON locks (expires_at);

    CREATE TABLE IF NOT EXISTS subscriptions (
        resource_id TEXT PRIMARY KEY,
        subscribed_at TEXT NOT NULL
    );

    -- Scheduled tasks (cron, UTC)
    CREATE TABLE IF NOT EXISTS scheduled_tasks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        cron_expression TEXT NOT NULL,
        prompt TEXT NOT NULL,
        delivery_config TEXT,            -- JSON document, passed through
        enabled INTEGER NOT NULL DEFAULT 1,
        last_run_at TEXT,
        next_run_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_due ON scheduled_tasks (enabled, next_run_at);

    -- Append-only execution history
    CREATE TABLE IF NOT EXISTS task_runs (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES scheduled_tasks(id) ON DELETE CASCADE,
        status TEXT NOT NULL CHECK (status IN ('running', 'success', 'error')),
        result TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_task_runs_task ON task_runs (task_id, started_at);
";

/// Shared handle to the embedded store. Cloning is cheap.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open or create the database at `path` (or `":memory:"`) and migrate it.
    /// Safe to call repeatedly on the same path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = if path == Path::new(IN_MEMORY) {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(path)
        }
        .map_err(|e| StewardError::Storage(format!("DB open {}: {e}", path.display())))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| StewardError::Storage(format!("DB pragmas: {e}")))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        };
        db.migrate()?;
        tracing::debug!("💾 Storage ready at {}", path.display());
        Ok(db)
    }

    /// Fresh private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(IN_MEMORY))
    }

    /// Apply every table and index definition. Idempotent.
    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            conn.execute(
                "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
                [SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        })
        .map_err(|e| StewardError::Storage(format!("Migration: {e}")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Readiness check: the connection answers a trivial query.
    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)))
            .map(|_| ())
    }

    pub fn schema_version(&self) -> Result<i64> {
        let raw: String = self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM schema_meta WHERE key = 'schema_version'",
                [],
                |r| r.get(0),
            )
        })?;
        raw.parse()
            .map_err(|e| StewardError::Storage(format!("Bad schema_version '{raw}': {e}")))
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StewardError::Storage(format!("Lock: {e}")))?;
        f(&conn).map_err(StewardError::storage)
    }

    /// Run `f` inside a transaction, committing only if it succeeds.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StewardError::Storage(format!("Lock: {e}")))?;
        let tx = conn.transaction().map_err(StewardError::storage)?;
        let value = f(&tx)?;
        tx.commit().map_err(StewardError::storage)?;
        Ok(value)
    }
}

// ─── Time encoding ──────────────────────────────────────

/// Encode an instant as fixed-width RFC 3339 (millis, `Z`) so text order = time order.
pub fn encode_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn decode_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

pub fn millis_to_time(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Clamp a TTL to i64 milliseconds.
pub(crate) fn ttl_millis(ttl: std::time::Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}
