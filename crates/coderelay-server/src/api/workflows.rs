//! Workflows API - /api/workflows
//!
//! Workflow definition CRUD plus run control. Definitions are accepted as
//! JSON bodies or imported from YAML.
//!
//! GET    /api/workflows                     - List workflows
//! POST   /api/workflows                     - Create from a JSON definition
//! POST   /api/workflows/import              - Create from a YAML document
//! GET    /api/workflows/{id}                - Get a workflow
//! DELETE /api/workflows/{id}                - Delete a workflow
//! POST   /api/workflows/{id}/run            - Start a run (DAG-validated first)
//! GET    /api/workflows/{id}/runs           - List runs
//! GET    /api/workflows/runs/{runId}        - Get a run
//! GET    /api/workflows/runs/{runId}/nodes  - List a run's node executions
//! POST   /api/workflows/runs/{runId}/cancel - Cancel a run

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use coderelay_core::error::EngineError;
use coderelay_core::state::AppState;
use coderelay_core::workflow::WorkflowDef;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workflows).post(create_workflow))
        .route("/import", post(import_workflow))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/nodes", get(list_run_nodes))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/{id}", get(get_workflow).delete(delete_workflow))
        .route("/{id}/run", post(run_workflow))
        .route("/{id}/runs", get(list_runs))
}

async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let workflows = state.workflow_store.list().await?;
    Ok(Json(serde_json::json!({ "workflows": workflows })))
}

async fn create_workflow(
    State(state): State<AppState>,
    Json(def): Json<WorkflowDef>,
) -> Result<Json<serde_json::Value>, EngineError> {
    // Reject invalid graphs at definition time, not first run.
    coderelay_core::workflow::WorkflowGraph::build(&def)?;
    let workflow = state.workflow_store.create(def).await?;
    Ok(Json(serde_json::json!({ "workflow": workflow })))
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    yaml: String,
}

async fn import_workflow(
    State(state): State<AppState>,
    Json(body): Json<ImportRequest>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let def = WorkflowDef::from_yaml(&body.yaml)?;
    coderelay_core::workflow::WorkflowGraph::build(&def)?;
    let workflow = state.workflow_store.create(def).await?;
    Ok(Json(serde_json::json!({ "workflow": workflow })))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    match state.workflow_store.get(&id).await? {
        Some(w) => Ok(Json(serde_json::json!({ "workflow": w }))),
        None => Err(EngineError::NotFound(format!("Workflow {} not found", id))),
    }
}

async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let deleted = state.workflow_store.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    #[serde(default)]
    payload: serde_json::Value,
}

/// POST /api/workflows/{id}/run — validate the DAG and start a run.
/// A cyclic graph is rejected here with zero node executions created.
async fn run_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RunRequest>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let run_id = state
        .workflow_runner
        .start_execution(&id, body.payload)
        .await?;
    Ok(Json(serde_json::json!({
        "workflowExecutionId": run_id,
        "workflowId": id,
    })))
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let runs = state.workflow_store.list_runs(&id).await?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    match state.workflow_store.get_run(&run_id).await? {
        Some(r) => Ok(Json(serde_json::json!({ "run": r }))),
        None => Err(EngineError::NotFound(format!("Run {} not found", run_id))),
    }
}

async fn list_run_nodes(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let nodes = state.workflow_store.list_node_runs(&run_id).await?;
    Ok(Json(serde_json::json!({ "nodes": nodes })))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let cancelled = state.workflow_runner.cancel(&run_id);
    if !cancelled && state.workflow_store.get_run(&run_id).await?.is_none() {
        return Err(EngineError::NotFound(format!("Run {} not found", run_id)));
    }
    Ok(Json(serde_json::json!({ "cancelled": cancelled, "runId": run_id })))
}
