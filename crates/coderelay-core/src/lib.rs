//! Coderelay Core — transport-agnostic execution & orchestration engine.
//!
//! This crate contains the domain logic of the Coderelay platform: trigger
//! and account definitions, the execution engine (process registry, log
//! broadcast hub, execution coordinator, fallback router), and the workflow
//! DAG executor. It has **no HTTP framework dependency** by default, making
//! it usable from:
//!
//! - the HTTP server (`coderelay-server`)
//! - the CLI (`coderelay-cli`)
//! - embedding applications
//!
//! # Feature Flags
//!
//! - `axum` — Enables `IntoResponse` impl on `EngineError` for axum handlers.

pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod shell_env;
pub mod state;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use db::Database;
pub use error::EngineError;
pub use state::{AppState, AppStateInner};
