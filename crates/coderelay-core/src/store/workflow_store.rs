use chrono::{TimeZone, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::execution::ExecutionStatus;
use crate::models::workflow_run::{NodeExecution, WorkflowExecution, WorkflowMessage};
use crate::workflow::schema::WorkflowDef;

/// A stored workflow definition plus its metadata row.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredWorkflow {
    pub id: String,
    pub name: String,
    pub definition: WorkflowDef,
    pub enabled: bool,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

/// Store for workflow definitions and their run records.
#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ─── Definitions ────────────────────────────────────────────────────

    pub async fn create(&self, def: WorkflowDef) -> Result<StoredWorkflow, EngineError> {
        let now = Utc::now();
        let wf = StoredWorkflow {
            id: Uuid::new_v4().to_string(),
            name: def.name.clone(),
            definition: def,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        let wc = wf.clone();
        let def_json = serde_json::to_string(&wc.definition)
            .map_err(|e| EngineError::Internal(format!("Serialize workflow: {}", e)))?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflows (id, name, definition, enabled, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        wc.id,
                        wc.name,
                        def_json,
                        wc.enabled as i64,
                        wc.created_at.timestamp_millis(),
                        wc.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(wf)
    }

    pub async fn get(&self, id: &str) -> Result<Option<StoredWorkflow>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, name, definition, enabled, created_at, updated_at \
                     FROM workflows WHERE id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_workflow(row)),
                )
                .optional()
            })
            .await
            .map(|opt| opt.flatten())
    }

    pub async fn list(&self) -> Result<Vec<StoredWorkflow>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, definition, enabled, created_at, updated_at \
                     FROM workflows ORDER BY created_at DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_workflow(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows.into_iter().flatten().collect())
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM workflows WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }

    // ─── Workflow runs ──────────────────────────────────────────────────

    pub async fn create_run(&self, run: &WorkflowExecution) -> Result<(), EngineError> {
        let r = run.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_executions (id, workflow_id, status, error, started_at, finished_at, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        r.id,
                        r.workflow_id,
                        r.status.as_str(),
                        r.error,
                        r.started_at.map(|t| t.timestamp_millis()),
                        r.finished_at.map(|t| t.timestamp_millis()),
                        r.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn update_run(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<String>,
        started_at: Option<chrono::DateTime<Utc>>,
        finished_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflow_executions SET status=?2, error=COALESCE(?3, error), \
                     started_at=COALESCE(?4, started_at), finished_at=COALESCE(?5, finished_at) \
                     WHERE id=?1",
                    rusqlite::params![
                        id,
                        status.as_str(),
                        error,
                        started_at.map(|t| t.timestamp_millis()),
                        finished_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_runs(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, EngineError> {
        let workflow_id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_id, status, error, started_at, finished_at, created_at \
                     FROM workflow_executions WHERE workflow_id = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![workflow_id], |row| Ok(row_to_run(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<WorkflowExecution>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, workflow_id, status, error, started_at, finished_at, created_at \
                     FROM workflow_executions WHERE id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_run(row)),
                )
                .optional()
            })
            .await
    }

    // ─── Node runs ──────────────────────────────────────────────────────

    pub async fn create_node_run(&self, node: &NodeExecution) -> Result<(), EngineError> {
        let n = node.clone();
        let input_json = n
            .input_message
            .as_ref()
            .and_then(|m| serde_json::to_string(m).ok());
        let output_json = n
            .output_message
            .as_ref()
            .and_then(|m| serde_json::to_string(m).ok());
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO node_executions (id, workflow_execution_id, node_id, status, \
                     input_message, output_message, error, started_at, finished_at, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        n.id,
                        n.workflow_execution_id,
                        n.node_id,
                        n.status.as_str(),
                        input_json,
                        output_json,
                        n.error,
                        n.started_at.map(|t| t.timestamp_millis()),
                        n.finished_at.map(|t| t.timestamp_millis()),
                        n.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn update_node_run(&self, node: &NodeExecution) -> Result<(), EngineError> {
        let n = node.clone();
        let output_json = n
            .output_message
            .as_ref()
            .and_then(|m| serde_json::to_string(m).ok());
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE node_executions SET status=?2, output_message=?3, error=?4, \
                     started_at=?5, finished_at=?6 WHERE id=?1",
                    rusqlite::params![
                        n.id,
                        n.status.as_str(),
                        output_json,
                        n.error,
                        n.started_at.map(|t| t.timestamp_millis()),
                        n.finished_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_node_runs(
        &self,
        workflow_execution_id: &str,
    ) -> Result<Vec<NodeExecution>, EngineError> {
        let run_id = workflow_execution_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_execution_id, node_id, status, input_message, \
                     output_message, error, started_at, finished_at, created_at \
                     FROM node_executions WHERE workflow_execution_id = ?1 ORDER BY created_at ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![run_id], |row| Ok(row_to_node_run(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_workflow(row: &rusqlite::Row<'_>) -> Option<StoredWorkflow> {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());

    let definition: WorkflowDef =
        serde_json::from_str(&row.get::<_, String>(2).unwrap_or_default()).ok()?;
    Some(StoredWorkflow {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        definition,
        enabled: row.get::<_, i64>(3).unwrap_or(0) != 0,
        created_at: to_dt(row.get(4).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(5).ok()).unwrap_or_else(Utc::now),
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> WorkflowExecution {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());

    WorkflowExecution {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        status: ExecutionStatus::parse(&row.get::<_, String>(2).unwrap_or_default())
            .unwrap_or(ExecutionStatus::Failed),
        error: row.get(3).unwrap_or(None),
        started_at: to_dt(row.get(4).unwrap_or(None)),
        finished_at: to_dt(row.get(5).unwrap_or(None)),
        created_at: to_dt(row.get(6).ok()).unwrap_or_else(Utc::now),
    }
}

fn row_to_node_run(row: &rusqlite::Row<'_>) -> NodeExecution {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());
    let to_msg = |json: Option<String>| -> Option<WorkflowMessage> {
        json.and_then(|s| serde_json::from_str(&s).ok())
    };

    NodeExecution {
        id: row.get(0).unwrap_or_default(),
        workflow_execution_id: row.get(1).unwrap_or_default(),
        node_id: row.get(2).unwrap_or_default(),
        status: ExecutionStatus::parse(&row.get::<_, String>(3).unwrap_or_default())
            .unwrap_or(ExecutionStatus::Failed),
        input_message: to_msg(row.get(4).unwrap_or(None)),
        output_message: to_msg(row.get(5).unwrap_or(None)),
        error: row.get(6).unwrap_or(None),
        started_at: to_dt(row.get(7).unwrap_or(None)),
        finished_at: to_dt(row.get(8).unwrap_or(None)),
        created_at: to_dt(row.get(9).ok()).unwrap_or_else(Utc::now),
    }
}
