//! SQLite persistence adapter for the devicegate engine.
//!
//! Sole writer of the three engine tables (`device_registrations`,
//! `device_access_logs`, `security_events`). Every other component
//! requests reads and writes through the `run`/`get`/`all` primitives —
//! no component holds its own connection.
//!
//! ## Concurrency
//! Connections live in an r2d2 pool sized to `max_concurrent_statements`
//! (default 10). The pool is the in-flight cap: callers past the cap
//! block on checkout until a slot frees. WAL-mode reads parallelise;
//! writes are serialised by SQLite's page lock + busy_timeout. Statements
//! execute on the blocking thread pool so async callers suspend instead
//! of stalling the runtime.

use crate::config::DevicegateConfig;
use crate::error::StoreError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;

/// Positional SQL parameters, owned so they can cross the blocking
/// task boundary.
pub type SqlParams = Vec<Value>;

/// Outcome of a mutating statement.
#[derive(Debug, Clone, Copy)]
pub struct RunResult {
    /// Rows inserted/updated/deleted by the statement.
    pub rows_affected: usize,
    /// Rowid of the most recent INSERT on this connection.
    pub last_insert_rowid: i64,
}

/// Shared handle to the SQLite store. Cheap to clone; all clones share
/// the same pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (or create) the database and apply the enterprise pragmas.
    ///
    /// Idempotent: the schema uses `IF NOT EXISTS` throughout, so
    /// connecting to an existing database only sets up the pool. Every
    /// pooled connection gets the same pragma profile on checkout
    /// initialisation.
    pub fn connect(config: &DevicegateConfig) -> Result<Self, StoreError> {
        let pragmas = format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA cache_size   = 10000;
             PRAGMA temp_store   = MEMORY;
             PRAGMA mmap_size    = 268435456;
             PRAGMA busy_timeout = {};",
            config.busy_timeout_ms
        );
        let manager = SqliteConnectionManager::file(&config.db_path)
            .with_init(move |conn| conn.execute_batch(&pragmas));

        let pool = Pool::builder()
            .max_size(config.max_concurrent_statements.max(1))
            .build(manager)?;

        let conn = pool.get()?;
        init_schema(&conn)?;
        drop(conn);

        tracing::info!(
            db_path = %config.db_path.display(),
            pool_size = config.max_concurrent_statements,
            "device store connected"
        );

        Ok(Self { pool })
    }

    /// Execute a mutating statement. Suspends while waiting for a pool
    /// slot and while the statement runs.
    pub async fn run(&self, sql: &str, params: SqlParams) -> Result<RunResult, StoreError> {
        let pool = self.pool.clone();
        let statement = sql.to_string();
        let result = tokio::task::spawn_blocking(move || -> Result<RunResult, StoreError> {
            let conn = pool.get()?;
            let rows_affected = conn.execute(&statement, rusqlite::params_from_iter(params))?;
            Ok(RunResult {
                rows_affected,
                last_insert_rowid: conn.last_insert_rowid(),
            })
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?;

        self.surface("run", sql, result)
    }

    /// Fetch at most one row, mapped by `map`. `None` when the query
    /// matches nothing.
    pub async fn get<T, F>(
        &self,
        sql: &str,
        params: SqlParams,
        map: F,
    ) -> Result<Option<T>, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let statement = sql.to_string();
        let result = tokio::task::spawn_blocking(move || -> Result<Option<T>, StoreError> {
            let conn = pool.get()?;
            match conn.query_row(&statement, rusqlite::params_from_iter(params), map) {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?;

        self.surface("get", sql, result)
    }

    /// Fetch all matching rows, mapped by `map`.
    pub async fn all<T, F>(&self, sql: &str, params: SqlParams, map: F) -> Result<Vec<T>, StoreError>
    where
        T: Send + 'static,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let statement = sql.to_string();
        let result = tokio::task::spawn_blocking(move || -> Result<Vec<T>, StoreError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&statement)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params), map)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?;

        self.surface("all", sql, result)
    }

    /// Log a driver failure with the offending statement before it
    /// propagates. Errors are surfaced, never swallowed.
    fn surface<T>(&self, op: &str, sql: &str, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(ref e) = result {
            tracing::error!(error = %e, op = op, sql = sql, "store statement failed");
        }
        result
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS device_registrations (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            employee_id      TEXT NOT NULL UNIQUE,
            full_name        TEXT NOT NULL,
            device_id        TEXT NOT NULL UNIQUE,
            fingerprint_hash TEXT NOT NULL,
            status           TEXT NOT NULL DEFAULT 'pending'
                             CHECK(status IN ('pending', 'approved', 'blocked', 'drift')),
            registration_ip  TEXT,
            user_agent       TEXT,
            registered_at    TEXT NOT NULL,
            last_login_at    TEXT,
            last_login_ip    TEXT,
            security_score   INTEGER NOT NULL DEFAULT 100,
            approved_by      TEXT,
            approved_at      TEXT,
            approval_reason  TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_registrations_status
            ON device_registrations(status);
        CREATE INDEX IF NOT EXISTS idx_registrations_created
            ON device_registrations(created_at);

        CREATE TABLE IF NOT EXISTS device_access_logs (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            employee_id      TEXT NOT NULL,
            fingerprint_hash TEXT,
            access_result    TEXT NOT NULL
                             CHECK(access_result IN ('success', 'blocked', 'pending', 'drift_detected')),
            ip_address       TEXT,
            user_agent       TEXT,
            security_notes   TEXT,
            access_time      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_access_logs_employee
            ON device_access_logs(employee_id);
        CREATE INDEX IF NOT EXISTS idx_access_logs_time
            ON device_access_logs(access_time);

        CREATE TABLE IF NOT EXISTS security_events (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type  TEXT NOT NULL,
            severity    TEXT NOT NULL
                        CHECK(severity IN ('LOW', 'MEDIUM', 'HIGH', 'CRITICAL')),
            employee_id TEXT,
            description TEXT NOT NULL,
            details     TEXT,
            ip_address  TEXT,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_security_events_type
            ON security_events(event_type);
        CREATE INDEX IF NOT EXISTS idx_security_events_severity
            ON security_events(severity);
        CREATE INDEX IF NOT EXISTS idx_security_events_time
            ON security_events(created_at);",
    )?;
    Ok(())
}
