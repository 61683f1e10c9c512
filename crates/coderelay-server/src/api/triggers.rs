//! Triggers API - /api/triggers
//!
//! Trigger definitions (webhook / schedule / GitHub) and the fire entry
//! point. Firing runs the fallback chain in the background; the execution
//! list and log stream expose progress.
//!
//! GET    /api/triggers            - List triggers
//! POST   /api/triggers            - Create a trigger
//! GET    /api/triggers/{id}       - Get a trigger
//! PATCH  /api/triggers/{id}       - Update a trigger
//! DELETE /api/triggers/{id}       - Delete a trigger
//! POST   /api/triggers/{id}/fire  - Fire the trigger with a payload

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use coderelay_core::error::EngineError;
use coderelay_core::models::trigger::{CreateTriggerInput, UpdateTriggerInput};
use coderelay_core::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_triggers).post(create_trigger))
        .route(
            "/{id}",
            get(get_trigger).patch(update_trigger).delete(delete_trigger),
        )
        .route("/{id}/fire", axum::routing::post(fire_trigger))
}

async fn list_triggers(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let triggers = state.trigger_store.list().await?;
    Ok(Json(serde_json::json!({ "triggers": triggers })))
}

async fn create_trigger(
    State(state): State<AppState>,
    Json(body): Json<CreateTriggerInput>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let trigger = state.trigger_store.create(body).await?;
    Ok(Json(serde_json::json!({ "trigger": trigger })))
}

async fn get_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    match state.trigger_store.get(&id).await? {
        Some(t) => Ok(Json(serde_json::json!({ "trigger": t }))),
        None => Err(EngineError::NotFound(format!("Trigger {} not found", id))),
    }
}

async fn update_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateTriggerInput>,
) -> Result<Json<serde_json::Value>, EngineError> {
    match state.trigger_store.update(&id, body).await? {
        Some(t) => Ok(Json(serde_json::json!({ "trigger": t }))),
        None => Err(EngineError::NotFound(format!("Trigger {} not found", id))),
    }
}

async fn delete_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let deleted = state.trigger_store.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FireRequest {
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default = "default_source")]
    source: String,
}

fn default_source() -> String {
    "manual".to_string()
}

/// POST /api/triggers/{id}/fire — fire the trigger's fallback chain.
async fn fire_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FireRequest>,
) -> Result<Json<serde_json::Value>, EngineError> {
    // Validate existence up front so a bad id is a 404, not a silent no-op.
    if state.trigger_store.get(&id).await?.is_none() {
        return Err(EngineError::NotFound(format!("Trigger {} not found", id)));
    }

    let router = state.router.clone();
    let trigger_id = id.clone();
    tokio::spawn(async move {
        match router
            .execute_with_fallback(&trigger_id, body.payload, &body.source)
            .await
        {
            Ok(execution) => tracing::info!(
                "[API] Trigger {} fired → execution {} ({})",
                trigger_id,
                execution.id,
                execution.status.as_str()
            ),
            Err(e) => tracing::error!("[API] Trigger {} fire failed: {}", trigger_id, e),
        }
    });

    Ok(Json(serde_json::json!({ "fired": true, "triggerId": id })))
}
