//! Integration test: start the backend server and drive the API end to end.

use std::sync::Arc;
use std::time::Duration;

use coderelay_core::db::Database;
use coderelay_core::state::{AppState, AppStateInner};

async fn start_test_server() -> (String, AppState) {
    let db = Database::open_in_memory().unwrap();
    let state: AppState = Arc::new(AppStateInner::new(db));
    state.recover().await.unwrap();

    let app = coderelay_server::app_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    (format!("http://{}", addr), state)
}

#[tokio::test]
async fn test_health_and_crud_surface() {
    let (base_url, _state) = start_test_server().await;
    let client = reqwest::Client::new();

    // ── Health ────────────────────────────────────────────────────
    let resp = client
        .get(format!("{}/api/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // ── Create an account ─────────────────────────────────────────
    let resp = client
        .post(format!("{}/api/accounts", base_url))
        .json(&serde_json::json!({
            "name": "primary",
            "backend": "claude-code",
            "apiKeyEnv": "ANTHROPIC_API_KEY_PRIMARY"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let account_id = body["account"]["id"].as_str().unwrap().to_string();

    // ── Create a trigger referencing it ───────────────────────────
    let resp = client
        .post(format!("{}/api/triggers", base_url))
        .json(&serde_json::json!({
            "name": "on-issue",
            "kind": "github",
            "promptTemplate": "Fix: ${payload.title}",
            "fallbackChain": [account_id],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let trigger_id = body["trigger"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["trigger"]["graceKillSecs"], 5);

    // ── List triggers ─────────────────────────────────────────────
    let resp = client
        .get(format!("{}/api/triggers", base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["triggers"].as_array().unwrap().len(), 1);

    // ── Unknown trigger fire is a 404 ─────────────────────────────
    let resp = client
        .post(format!("{}/api/triggers/nope/fire", base_url))
        .json(&serde_json::json!({ "payload": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // ── Executions list starts empty ──────────────────────────────
    let resp = client
        .get(format!("{}/api/executions", base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["executions"].as_array().unwrap().len(), 0);

    // ── Trigger PATCH round-trip ──────────────────────────────────
    let resp = client
        .patch(format!("{}/api/triggers/{}", base_url, trigger_id))
        .json(&serde_json::json!({ "budgetLimitMicrousd": 5_000_000 }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["trigger"]["budgetLimitMicrousd"], 5_000_000);
}

#[tokio::test]
async fn test_workflow_crud_and_cycle_rejection() {
    let (base_url, state) = start_test_server().await;
    let client = reqwest::Client::new();

    // ── Import a valid workflow from YAML ─────────────────────────
    let yaml = r#"
name: "Smoke"
nodes:
  - { id: hello, kind: command, run: "echo hello" }
"#;
    let resp = client
        .post(format!("{}/api/workflows/import", base_url))
        .json(&serde_json::json!({ "yaml": yaml }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let workflow_id = body["workflow"]["id"].as_str().unwrap().to_string();

    // ── A cyclic definition is rejected at creation ───────────────
    let resp = client
        .post(format!("{}/api/workflows", base_url))
        .json(&serde_json::json!({
            "name": "Cyclic",
            "nodes": [
                { "id": "a", "kind": "command", "run": "true" },
                { "id": "b", "kind": "command", "run": "true" }
            ],
            "edges": [
                { "from": "a", "to": "b" },
                { "from": "b", "to": "a" }
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    // ── Run the valid workflow and wait for it to finish ──────────
    let resp = client
        .post(format!("{}/api/workflows/{}/run", base_url, workflow_id))
        .json(&serde_json::json!({ "payload": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let run_id = body["workflowExecutionId"].as_str().unwrap().to_string();

    let mut finished = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let run = state.workflow_store.get_run(&run_id).await.unwrap().unwrap();
        if run.status.is_terminal() {
            finished = Some(run);
            break;
        }
    }
    let run = finished.expect("workflow run should finish");
    assert_eq!(
        run.status,
        coderelay_core::models::execution::ExecutionStatus::Completed
    );

    // ── Node executions are visible over the API ──────────────────
    let resp = client
        .get(format!("{}/api/workflows/runs/{}/nodes", base_url, run_id))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    let nodes = body["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["status"], "completed");
}

#[tokio::test]
async fn test_sse_log_stream_replays_and_completes() {
    let (base_url, state) = start_test_server().await;
    let client = reqwest::Client::new();

    // Run a short execution directly through the engine.
    let running = state
        .coordinator
        .start(coderelay_core::engine::StartRequest {
            trigger_id: None,
            node_ref: None,
            account_id: None,
            command: coderelay_core::engine::CommandSpec::for_shell(
                "echo one; echo two",
                ".",
            ),
            budget_limit_microusd: None,
            budget_spent_microusd: 0,
            grace_kill: Duration::from_secs(2),
        })
        .await
        .unwrap();
    let id = running.execution_id.clone();
    let finished = running.wait().await.unwrap();
    assert_eq!(
        finished.status,
        coderelay_core::models::execution::ExecutionStatus::Completed
    );

    // Subscribe after completion: replay + synthesized complete event.
    let resp = client
        .get(format!("{}/api/executions/{}/logs", base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Read the SSE body until the complete event arrives.
    let mut body = String::new();
    let mut stream = resp;
    while !body.contains("event: complete") {
        match tokio::time::timeout(Duration::from_secs(5), stream.chunk()).await {
            Ok(Ok(Some(chunk))) => body.push_str(&String::from_utf8_lossy(&chunk)),
            _ => break,
        }
    }
    assert!(body.contains("event: log"), "body: {}", body);
    assert!(body.contains("one"));
    assert!(body.contains("two"));
    assert!(body.contains("event: complete"));
    assert!(body.contains("completed"));

    // Reconnect with lastSeenSeq=1: only seq 2 is replayed.
    let resp = client
        .get(format!(
            "{}/api/executions/{}/logs?lastSeenSeq=1",
            base_url, id
        ))
        .send()
        .await
        .unwrap();
    let mut body = String::new();
    let mut stream = resp;
    while !body.contains("event: complete") {
        match tokio::time::timeout(Duration::from_secs(5), stream.chunk()).await {
            Ok(Ok(Some(chunk))) => body.push_str(&String::from_utf8_lossy(&chunk)),
            _ => break,
        }
    }
    assert!(!body.contains("\"seq\":1"), "body: {}", body);
    assert!(body.contains("\"seq\":2"));

    // The durable archive holds both lines.
    let resp = client
        .get(format!("{}/api/executions/{}/logs/archive", base_url, id))
        .send()
        .await
        .unwrap();
    let archive: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(archive["lines"].as_array().unwrap().len(), 2);
}
