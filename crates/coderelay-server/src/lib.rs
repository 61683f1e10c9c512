//! Coderelay Server — HTTP adapter for the execution & orchestration engine.
//!
//! A standalone axum backend exposing:
//! - REST CRUD for accounts, triggers, and workflows
//! - trigger fire / workflow run entry points
//! - execution status, cancellation, and the SSE live-log stream
//!
//! Startup performs crash recovery before accepting any request: orphaned
//! execution records are reconciled and persisted rate-limit retries are
//! rescheduled.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use coderelay_core::db::Database;
use coderelay_core::state::{AppState, AppStateInner};

/// Configuration for the Coderelay backend server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3420,
            db_path: "coderelay.db".to_string(),
        }
    }
}

/// Create a shared `AppState` from a database path and run crash recovery.
pub async fn create_app_state(db_path: &str) -> Result<AppState, String> {
    let db = Database::open(db_path).map_err(|e| format!("Failed to open database: {}", e))?;

    let state: AppState = Arc::new(AppStateInner::new(db));

    // Recovery must finish before any new execution starts.
    state
        .recover()
        .await
        .map_err(|e| format!("Crash recovery failed: {}", e))?;

    Ok(state)
}

/// Build the full application router.
pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the backend server. Returns the address it is listening on.
pub async fn start_server(config: ServerConfig) -> Result<SocketAddr, String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coderelay_server=info,coderelay_core=info,tower_http=info".into()),
        )
        .init();

    tracing::info!(
        "Starting Coderelay backend server on {}:{}",
        config.host,
        config.port
    );

    let state = create_app_state(&config.db_path).await?;
    start_server_with_state(config, state).await
}

/// Start the HTTP server with a pre-built `AppState`.
pub async fn start_server_with_state(
    config: ServerConfig,
    state: AppState,
) -> Result<SocketAddr, String> {
    // Periodic sweep of expired log buffers (TTL-based retention).
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let swept = state.hub.sweep_expired();
                if swept > 0 {
                    tracing::debug!("[Server] Swept {} expired log buffer(s)", swept);
                }
            }
        });
    }

    let app = app_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to read local addr: {}", e))?;

    tracing::info!("Coderelay backend listening on http://{}", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok(local_addr)
}
