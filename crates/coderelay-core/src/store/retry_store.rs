use chrono::{TimeZone, Utc};
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::retry::RetryState;

/// Durable store for in-flight rate-limit retry state.
#[derive(Clone)]
pub struct RetryStore {
    db: Database,
}

impl RetryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the retry entry for an execution key.
    pub async fn persist(&self, state: &RetryState) -> Result<(), EngineError> {
        let s = state.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO retry_state (execution_key, trigger_id, payload, source, \
                     next_account_index, attempt_count, backoff_seconds, next_retry_at, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        s.execution_key,
                        s.trigger_id,
                        s.payload.to_string(),
                        s.source,
                        s.next_account_index as i64,
                        s.attempt_count as i64,
                        s.backoff_seconds as i64,
                        s.next_retry_at.timestamp_millis(),
                        s.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, execution_key: &str) -> Result<Option<RetryState>, EngineError> {
        let key = execution_key.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM retry_state WHERE execution_key = ?1", COLUMNS),
                    rusqlite::params![key],
                    |row| Ok(row_to_retry(row)),
                )
                .optional()
            })
            .await
    }

    /// All pending retries, ordered by due time.
    pub async fn load_pending(&self) -> Result<Vec<RetryState>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM retry_state ORDER BY next_retry_at ASC",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_retry(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Remove an entry, returning whether it existed. Used both for normal
    /// completion and to claim a retry exactly once during startup resume.
    pub async fn delete(&self, execution_key: &str) -> Result<bool, EngineError> {
        let key = execution_key.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "DELETE FROM retry_state WHERE execution_key = ?1",
                    rusqlite::params![key],
                )?;
                Ok(n > 0)
            })
            .await
    }
}

const COLUMNS: &str = "execution_key, trigger_id, payload, source, next_account_index, \
                       attempt_count, backoff_seconds, next_retry_at, created_at";

fn row_to_retry(row: &rusqlite::Row<'_>) -> RetryState {
    let to_dt = |ms: i64| Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now);

    RetryState {
        execution_key: row.get(0).unwrap_or_default(),
        trigger_id: row.get(1).unwrap_or_default(),
        payload: serde_json::from_str(&row.get::<_, String>(2).unwrap_or_default())
            .unwrap_or(serde_json::Value::Null),
        source: row.get(3).unwrap_or_default(),
        next_account_index: row.get::<_, i64>(4).unwrap_or(0) as usize,
        attempt_count: row.get::<_, i64>(5).unwrap_or(0) as u32,
        backoff_seconds: row.get::<_, i64>(6).unwrap_or(0) as u64,
        next_retry_at: to_dt(row.get(7).unwrap_or(0)),
        created_at: to_dt(row.get(8).unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(key: &str) -> RetryState {
        RetryState {
            execution_key: key.to_string(),
            trigger_id: "trig-1".to_string(),
            payload: serde_json::json!({"issue": 42}),
            source: "webhook".to_string(),
            next_account_index: 1,
            attempt_count: 1,
            backoff_seconds: 30,
            next_retry_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn persist_load_delete_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let store = RetryStore::new(db);

        store.persist(&sample("key-1")).await.unwrap();
        store.persist(&sample("key-2")).await.unwrap();

        let pending = store.load_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload["issue"], 42);

        // Delete claims exactly once
        assert!(store.delete("key-1").await.unwrap());
        assert!(!store.delete("key-1").await.unwrap());
        assert_eq!(store.load_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persist_replaces_existing_key() {
        let db = Database::open_in_memory().unwrap();
        let store = RetryStore::new(db);

        store.persist(&sample("key-1")).await.unwrap();
        let mut updated = sample("key-1");
        updated.attempt_count = 3;
        updated.backoff_seconds = 120;
        store.persist(&updated).await.unwrap();

        let loaded = store.get("key-1").await.unwrap().unwrap();
        assert_eq!(loaded.attempt_count, 3);
        assert_eq!(loaded.backoff_seconds, 120);
        assert_eq!(store.load_pending().await.unwrap().len(), 1);
    }
}
