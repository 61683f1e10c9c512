//! Core error type for the Coderelay engine.
//!
//! `EngineError` is used throughout the core domain (stores, engine,
//! workflow executor). When the `axum` feature is enabled, it also
//! implements `IntoResponse` so it can be used directly as an axum
//! handler error type.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, message) = match &self {
            EngineError::Database(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            EngineError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            EngineError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            EngineError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            EngineError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            EngineError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}
