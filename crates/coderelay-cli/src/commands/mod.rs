//! CLI command implementations. Each command builds the shared `AppState`
//! and talks to the engine directly — no HTTP round-trip needed.

use std::sync::Arc;

use coderelay_core::models::account::{BackendKind, CreateAccountInput};
use coderelay_core::state::{AppState, AppStateInner};
use coderelay_core::workflow::WorkflowDef;
use coderelay_core::Database;

type CliResult = Result<(), String>;

async fn open_state(db_path: &str) -> Result<AppState, String> {
    let db = Database::open(db_path).map_err(|e| e.to_string())?;
    let state: AppState = Arc::new(AppStateInner::new(db));
    state.recover().await.map_err(|e| e.to_string())?;
    Ok(state)
}

fn parse_payload(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("Invalid JSON payload: {}", e))
}

// ─── serve ──────────────────────────────────────────────────────────────

pub async fn serve(host: String, port: u16, db_path: String) -> CliResult {
    let config = coderelay_server::ServerConfig {
        host,
        port,
        db_path,
    };
    coderelay_server::start_server(config).await?;
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Signal error: {}", e))?;
    println!("Shutting down.");
    Ok(())
}

// ─── accounts ───────────────────────────────────────────────────────────

pub async fn account_list(db_path: &str) -> CliResult {
    let state = open_state(db_path).await?;
    let accounts = state.account_store.list().await.map_err(|e| e.to_string())?;
    if accounts.is_empty() {
        println!("No accounts configured.");
        return Ok(());
    }
    for a in accounts {
        println!(
            "{}  {:12} {:12} key-env: {}",
            a.id,
            a.name,
            a.backend.as_str(),
            a.api_key_env.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn account_add(
    db_path: &str,
    name: String,
    backend: String,
    api_key_env: Option<String>,
    model: Option<String>,
) -> CliResult {
    let backend = BackendKind::parse(&backend)
        .ok_or_else(|| format!("Unknown backend '{}'. Use claude-code, codex, or opencode.", backend))?;
    let state = open_state(db_path).await?;
    let account = state
        .account_store
        .create(CreateAccountInput {
            name,
            backend,
            api_key_env,
            model,
            base_url: None,
        })
        .await
        .map_err(|e| e.to_string())?;
    println!("Created account {} ({})", account.id, account.name);
    Ok(())
}

pub async fn account_remove(db_path: &str, id: &str) -> CliResult {
    let state = open_state(db_path).await?;
    let deleted = state.account_store.delete(id).await.map_err(|e| e.to_string())?;
    if deleted {
        println!("Removed account {}", id);
        Ok(())
    } else {
        Err(format!("Account {} not found", id))
    }
}

// ─── triggers ───────────────────────────────────────────────────────────

pub async fn trigger_list(db_path: &str) -> CliResult {
    let state = open_state(db_path).await?;
    let triggers = state.trigger_store.list().await.map_err(|e| e.to_string())?;
    if triggers.is_empty() {
        println!("No triggers configured.");
        return Ok(());
    }
    for t in triggers {
        println!(
            "{}  {:20} {:8} chain: [{}]{}",
            t.id,
            t.name,
            t.kind.as_str(),
            t.fallback_chain.join(", "),
            if t.enabled { "" } else { "  (disabled)" }
        );
    }
    Ok(())
}

pub async fn trigger_fire(db_path: &str, id: &str, payload: &str) -> CliResult {
    let payload = parse_payload(payload)?;
    let state = open_state(db_path).await?;

    println!("Firing trigger {} ...", id);
    let execution = state
        .router
        .execute_with_fallback(id, payload, "cli")
        .await
        .map_err(|e| e.to_string())?;

    println!(
        "Execution {} finished: {}{}",
        execution.id,
        execution.status.as_str(),
        execution
            .reason
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default()
    );
    let lines = state
        .log_store
        .list(&execution.id)
        .await
        .map_err(|e| e.to_string())?;
    for line in lines {
        println!("[{}] {}", line.stream.as_str(), line.text);
    }
    Ok(())
}

// ─── workflows ──────────────────────────────────────────────────────────

pub async fn workflow_list(db_path: &str) -> CliResult {
    let state = open_state(db_path).await?;
    let workflows = state.workflow_store.list().await.map_err(|e| e.to_string())?;
    if workflows.is_empty() {
        println!("No workflows defined.");
        return Ok(());
    }
    for w in workflows {
        println!(
            "{}  {:24} {} node(s)",
            w.id,
            w.name,
            w.definition.nodes.len()
        );
    }
    Ok(())
}

pub async fn workflow_import(db_path: &str, path: &str) -> CliResult {
    let def = WorkflowDef::from_file(path).map_err(|e| e.to_string())?;
    // Surface graph problems at import time.
    coderelay_core::workflow::WorkflowGraph::build(&def).map_err(|e| e.to_string())?;
    let state = open_state(db_path).await?;
    let workflow = state
        .workflow_store
        .create(def)
        .await
        .map_err(|e| e.to_string())?;
    println!("Imported workflow {} ({})", workflow.id, workflow.name);
    Ok(())
}

pub async fn workflow_run(db_path: &str, id: &str, payload: &str) -> CliResult {
    let payload = parse_payload(payload)?;
    let state = open_state(db_path).await?;

    println!("Running workflow {} ...", id);
    let run = state
        .workflow_runner
        .run_to_completion(id, payload)
        .await
        .map_err(|e| e.to_string())?;

    println!("Run {} finished: {}", run.id, run.status.as_str());
    let nodes = state
        .workflow_store
        .list_node_runs(&run.id)
        .await
        .map_err(|e| e.to_string())?;
    for node in nodes {
        println!(
            "  {:20} {}{}",
            node.node_id,
            node.status.as_str(),
            node.error
                .as_deref()
                .map(|e| format!("  ({})", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

// ─── executions ─────────────────────────────────────────────────────────

pub async fn execution_list(db_path: &str, limit: usize) -> CliResult {
    let state = open_state(db_path).await?;
    let executions = state
        .execution_store
        .list_recent(limit)
        .await
        .map_err(|e| e.to_string())?;
    if executions.is_empty() {
        println!("No executions recorded.");
        return Ok(());
    }
    for e in executions {
        println!(
            "{}  {:12} trigger: {:36} cost: {} µUSD{}",
            e.id,
            e.status.as_str(),
            e.trigger_id.as_deref().unwrap_or("-"),
            e.cost_microusd,
            e.reason
                .as_deref()
                .map(|r| format!("  ({})", r))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn execution_status(db_path: &str, id: &str) -> CliResult {
    let state = open_state(db_path).await?;
    match state.execution_store.get(id).await.map_err(|e| e.to_string())? {
        Some(e) => {
            println!("{}", serde_json::to_string_pretty(&e).unwrap_or_default());
            Ok(())
        }
        None => Err(format!("Execution {} not found", id)),
    }
}

pub async fn execution_cancel(db_path: &str, id: &str) -> CliResult {
    let state = open_state(db_path).await?;
    if state.coordinator.cancel(id) {
        println!("Cancellation requested for {}", id);
        Ok(())
    } else {
        Err(format!("Execution {} has no live process", id))
    }
}

pub async fn execution_logs(db_path: &str, id: &str) -> CliResult {
    let state = open_state(db_path).await?;
    let lines = state.log_store.list(id).await.map_err(|e| e.to_string())?;
    if lines.is_empty() {
        println!("No archived logs for {}", id);
        return Ok(());
    }
    for line in lines {
        println!(
            "{:>6} [{}] {}",
            line.seq,
            line.stream.as_str(),
            line.text
        );
    }
    Ok(())
}
