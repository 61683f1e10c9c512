//! REST API surface.

pub mod accounts;
pub mod executions;
pub mod logs;
pub mod triggers;
pub mod workflows;

use axum::routing::get;
use axum::{Json, Router};

use coderelay_core::state::AppState;

/// Build the combined `/api` router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .nest("/api/accounts", accounts::router())
        .nest("/api/triggers", triggers::router())
        .nest("/api/executions", executions::router())
        .nest("/api/workflows", workflows::router())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
