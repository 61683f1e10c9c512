use chrono::{TimeZone, Utc};
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::execution::{reason, Execution, ExecutionStatus};

/// Durable store for execution records.
///
/// The engine writes here at creation and at each terminal transition only;
/// all intermediate state is in-memory.
#[derive(Clone)]
pub struct ExecutionStore {
    db: Database,
}

impl ExecutionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, execution: &Execution) -> Result<(), EngineError> {
        let e = execution.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO executions (id, trigger_id, node_ref, status, reason, account_id, \
                     exit_code, cost_microusd, started_at, finished_at, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        e.id,
                        e.trigger_id,
                        e.node_ref,
                        e.status.as_str(),
                        e.reason,
                        e.account_id,
                        e.exit_code,
                        e.cost_microusd,
                        e.started_at.map(|t| t.timestamp_millis()),
                        e.finished_at.map(|t| t.timestamp_millis()),
                        e.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Persist a status transition. Terminal transitions carry the final
    /// reason, exit code, cost, and finished_at timestamp.
    pub async fn update_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        update: StatusUpdate,
    ) -> Result<(), EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE executions SET status=?2, \
                     reason=COALESCE(?3, reason), \
                     account_id=COALESCE(?4, account_id), \
                     exit_code=COALESCE(?5, exit_code), \
                     cost_microusd=COALESCE(?6, cost_microusd), \
                     started_at=COALESCE(?7, started_at), \
                     finished_at=COALESCE(?8, finished_at) \
                     WHERE id=?1",
                    rusqlite::params![
                        id,
                        status.as_str(),
                        update.reason,
                        update.account_id,
                        update.exit_code,
                        update.cost_microusd,
                        update.started_at.map(|t| t.timestamp_millis()),
                        update.finished_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Execution>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM executions WHERE id = ?1", COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_execution(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Execution>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM executions ORDER BY created_at DESC LIMIT ?1",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit as i64], |row| {
                        Ok(row_to_execution(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Total terminal spend recorded against a trigger, in micro-USD.
    pub async fn accumulated_cost(&self, trigger_id: &str) -> Result<i64, EngineError> {
        let trigger_id = trigger_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT COALESCE(SUM(cost_microusd), 0) FROM executions WHERE trigger_id = ?1",
                    rusqlite::params![trigger_id],
                    |row| row.get::<_, i64>(0),
                )
            })
            .await
    }

    /// Transition every record left `pending` or `running` by a previous
    /// process to `failed` with the documented restart reason. Returns the
    /// ids that were reconciled.
    pub async fn fail_incomplete_on_startup(&self) -> Result<Vec<String>, EngineError> {
        let now_ms = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM executions WHERE status IN ('pending', 'running')",
                )?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                conn.execute(
                    "UPDATE executions SET status='failed', reason=?1, finished_at=?2 \
                     WHERE status IN ('pending', 'running')",
                    rusqlite::params![reason::INTERRUPTED_BY_RESTART, now_ms],
                )?;
                Ok(ids)
            })
            .await
    }
}

/// Optional fields carried by a status transition.
#[derive(Debug, Default, Clone)]
pub struct StatusUpdate {
    pub reason: Option<String>,
    pub account_id: Option<String>,
    pub exit_code: Option<i32>,
    pub cost_microusd: Option<i64>,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub finished_at: Option<chrono::DateTime<Utc>>,
}

const COLUMNS: &str = "id, trigger_id, node_ref, status, reason, account_id, exit_code, \
                       cost_microusd, started_at, finished_at, created_at";

fn row_to_execution(row: &rusqlite::Row<'_>) -> Execution {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());

    Execution {
        id: row.get(0).unwrap_or_default(),
        trigger_id: row.get(1).unwrap_or(None),
        node_ref: row.get(2).unwrap_or(None),
        status: ExecutionStatus::parse(&row.get::<_, String>(3).unwrap_or_default())
            .unwrap_or(ExecutionStatus::Failed),
        reason: row.get(4).unwrap_or(None),
        account_id: row.get(5).unwrap_or(None),
        exit_code: row.get(6).unwrap_or(None),
        cost_microusd: row.get(7).unwrap_or(0),
        started_at: to_dt(row.get(8).unwrap_or(None)),
        finished_at: to_dt(row.get(9).unwrap_or(None)),
        created_at: to_dt(row.get(10).ok()).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let store = ExecutionStore::new(db);

        let exec = Execution::new(Some("trig-1".to_string()), None);
        store.create(&exec).await.unwrap();

        let loaded = store.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, exec.id);
        assert_eq!(loaded.status, ExecutionStatus::Pending);
        assert_eq!(loaded.trigger_id.as_deref(), Some("trig-1"));
    }

    #[tokio::test]
    async fn startup_reconciliation_fails_incomplete_records() {
        let db = Database::open_in_memory().unwrap();
        let store = ExecutionStore::new(db);

        let mut running = Execution::new(Some("trig-1".to_string()), None);
        running.status = ExecutionStatus::Running;
        store.create(&running).await.unwrap();

        let mut done = Execution::new(Some("trig-1".to_string()), None);
        done.status = ExecutionStatus::Completed;
        store.create(&done).await.unwrap();

        let reconciled = store.fail_incomplete_on_startup().await.unwrap();
        assert_eq!(reconciled, vec![running.id.clone()]);

        let loaded = store.get(&running.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.reason.as_deref(), Some(reason::INTERRUPTED_BY_RESTART));
        assert!(loaded.finished_at.is_some());

        let untouched = store.get(&done.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn accumulated_cost_sums_per_trigger() {
        let db = Database::open_in_memory().unwrap();
        let store = ExecutionStore::new(db);

        for cost in [1_500_000_i64, 2_500_000] {
            let mut e = Execution::new(Some("trig-1".to_string()), None);
            e.cost_microusd = cost;
            store.create(&e).await.unwrap();
        }
        let mut other = Execution::new(Some("trig-2".to_string()), None);
        other.cost_microusd = 9_000_000;
        store.create(&other).await.unwrap();

        assert_eq!(store.accumulated_cost("trig-1").await.unwrap(), 4_000_000);
    }
}
