//! Accounts API - /api/accounts
//!
//! Backend accounts referenced by trigger fallback chains. API keys are
//! referenced by environment-variable name, never stored.
//!
//! GET    /api/accounts       - List accounts
//! POST   /api/accounts       - Create an account
//! GET    /api/accounts/{id}  - Get an account
//! DELETE /api/accounts/{id}  - Delete an account

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use coderelay_core::error::EngineError;
use coderelay_core::models::account::CreateAccountInput;
use coderelay_core::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_accounts).post(create_account))
        .route("/{id}", get(get_account).delete(delete_account))
}

async fn list_accounts(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let accounts = state.account_store.list().await?;
    Ok(Json(serde_json::json!({ "accounts": accounts })))
}

async fn create_account(
    State(state): State<AppState>,
    Json(body): Json<CreateAccountInput>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let account = state.account_store.create(body).await?;
    Ok(Json(serde_json::json!({ "account": account })))
}

async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    match state.account_store.get(&id).await? {
        Some(a) => Ok(Json(serde_json::json!({ "account": a }))),
        None => Err(EngineError::NotFound(format!("Account {} not found", id))),
    }
}

async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let deleted = state.account_store.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
