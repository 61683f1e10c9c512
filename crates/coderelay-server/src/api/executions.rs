//! Executions API - /api/executions
//!
//! Operator-facing execution records plus the imperative cancel entry point.
//!
//! GET  /api/executions                    - List recent executions
//! GET  /api/executions/{id}               - Get an execution
//! POST /api/executions/{id}/cancel        - Request cooperative cancellation
//! GET  /api/executions/{id}/logs          - SSE live log stream (see logs.rs)
//! GET  /api/executions/{id}/logs/archive  - Durable log archive

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use coderelay_core::error::EngineError;
use coderelay_core::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_executions))
        .route("/{id}", get(get_execution))
        .route("/{id}/cancel", axum::routing::post(cancel_execution))
        .route("/{id}/logs", get(super::logs::execution_logs_sse))
        .route("/{id}/logs/archive", get(log_archive))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let executions = state
        .execution_store
        .list_recent(q.limit.unwrap_or(50))
        .await?;
    Ok(Json(serde_json::json!({ "executions": executions })))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    match state.execution_store.get(&id).await? {
        Some(e) => Ok(Json(serde_json::json!({ "execution": e }))),
        None => Err(EngineError::NotFound(format!("Execution {} not found", id))),
    }
}

/// POST /api/executions/{id}/cancel — advisory-then-forceful cancellation.
async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let cancelled = state.coordinator.cancel(&id);
    if !cancelled && state.execution_store.get(&id).await?.is_none() {
        return Err(EngineError::NotFound(format!("Execution {} not found", id)));
    }
    Ok(Json(serde_json::json!({ "cancelled": cancelled, "id": id })))
}

async fn log_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    if state.execution_store.get(&id).await?.is_none() {
        return Err(EngineError::NotFound(format!("Execution {} not found", id)));
    }
    let lines = state.log_store.list(&id).await?;
    Ok(Json(serde_json::json!({ "lines": lines })))
}
