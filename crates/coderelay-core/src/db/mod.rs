//! SQLite database layer for the Coderelay backend.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| EngineError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS accounts (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    backend         TEXT NOT NULL,
                    api_key_env     TEXT,
                    model           TEXT,
                    base_url        TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS triggers (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    kind            TEXT NOT NULL,
                    prompt_template TEXT NOT NULL,
                    working_dir     TEXT NOT NULL DEFAULT '.',
                    fallback_chain  TEXT NOT NULL DEFAULT '[]',
                    budget_limit_microusd INTEGER,
                    grace_kill_secs INTEGER NOT NULL DEFAULT 5,
                    enabled         INTEGER NOT NULL DEFAULT 1,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS executions (
                    id              TEXT PRIMARY KEY,
                    trigger_id      TEXT,
                    node_ref        TEXT,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    reason          TEXT,
                    account_id      TEXT,
                    exit_code       INTEGER,
                    cost_microusd   INTEGER NOT NULL DEFAULT 0,
                    started_at      INTEGER,
                    finished_at     INTEGER,
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_executions_trigger ON executions(trigger_id);
                CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

                CREATE TABLE IF NOT EXISTS execution_logs (
                    execution_id    TEXT NOT NULL,
                    seq             INTEGER NOT NULL,
                    stream          TEXT NOT NULL,
                    ts              INTEGER NOT NULL,
                    text            TEXT NOT NULL,
                    PRIMARY KEY (execution_id, seq)
                );

                CREATE TABLE IF NOT EXISTS retry_state (
                    execution_key   TEXT PRIMARY KEY,
                    trigger_id      TEXT NOT NULL,
                    payload         TEXT NOT NULL DEFAULT '{}',
                    source          TEXT NOT NULL DEFAULT 'manual',
                    next_account_index INTEGER NOT NULL,
                    attempt_count   INTEGER NOT NULL,
                    backoff_seconds INTEGER NOT NULL,
                    next_retry_at   INTEGER NOT NULL,
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_retry_next ON retry_state(next_retry_at);

                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    definition      TEXT NOT NULL,
                    enabled         INTEGER NOT NULL DEFAULT 1,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_executions (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    error           TEXT,
                    started_at      INTEGER,
                    finished_at     INTEGER,
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_wf_exec_workflow ON workflow_executions(workflow_id);

                CREATE TABLE IF NOT EXISTS node_executions (
                    id                      TEXT PRIMARY KEY,
                    workflow_execution_id   TEXT NOT NULL,
                    node_id                 TEXT NOT NULL,
                    status                  TEXT NOT NULL DEFAULT 'pending',
                    input_message           TEXT,
                    output_message          TEXT,
                    error                   TEXT,
                    started_at              INTEGER,
                    finished_at             INTEGER,
                    created_at              INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_node_exec_run ON node_executions(workflow_execution_id);
                ",
            )
        })
    }
}
