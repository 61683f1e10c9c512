//! Workflow DAG executor — drives a node/edge graph through its handlers.
//!
//! Validation (cycle detection) happens before any node-execution record is
//! created: a cyclic graph fails the whole workflow with zero side effects.
//!
//! Execution guarantee: nodes run strictly sequentially in topological
//! order, with document order breaking ties. A node never starts before all
//! of its upstream dependencies report `completed`.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::process::Command;

use crate::engine::registry::ProcessRegistry;
use crate::engine::router::{render_prompt, DispatchSpec, FallbackRouter};
use crate::error::EngineError;
use crate::models::execution::ExecutionStatus;
use crate::models::workflow_run::{NodeExecution, WorkflowExecution, WorkflowMessage};
use crate::shell_env;
use crate::store::{LogStore, WorkflowStore};
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::schema::{NodeDef, NodeKind, WorkflowDef};

/// In-memory outcome of a node within one run. Rows persist a coarser view
/// (pruned and upstream-skipped both record as `cancelled`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeOutcome {
    Completed,
    Failed,
    /// Not run because an upstream node failed.
    SkippedFailure,
    /// Not run because a conditional selected the other branch.
    Pruned,
}

/// Drives workflow runs against the engine.
pub struct WorkflowRunner {
    workflows: WorkflowStore,
    router: Arc<FallbackRouter>,
    logs: LogStore,
    registry: ProcessRegistry,
    cancels: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl WorkflowRunner {
    pub fn new(
        workflows: WorkflowStore,
        router: Arc<FallbackRouter>,
        logs: LogStore,
        registry: ProcessRegistry,
    ) -> Self {
        Self {
            workflows,
            router,
            logs,
            registry,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Validate the workflow, create its run record, and drive it in the
    /// background. Returns the workflow execution id.
    pub async fn start_execution(
        self: &Arc<Self>,
        workflow_id: &str,
        payload: serde_json::Value,
    ) -> Result<String, EngineError> {
        let (run, def, graph) = self.prepare(workflow_id, &payload).await?;
        let run_id = run.id.clone();
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = runner.drive(run, def, graph, payload).await {
                tracing::error!("[Workflow] Run failed to finalize: {}", e);
            }
        });
        Ok(run_id)
    }

    /// Validate and run a workflow inline, returning its terminal record.
    pub async fn run_to_completion(
        self: &Arc<Self>,
        workflow_id: &str,
        payload: serde_json::Value,
    ) -> Result<WorkflowExecution, EngineError> {
        let (run, def, graph) = self.prepare(workflow_id, &payload).await?;
        self.drive(run, def, graph, payload).await
    }

    /// Request cancellation of a running workflow: the flag stops the node
    /// loop, and every in-flight node execution is cancelled through the
    /// process registry.
    pub fn cancel(&self, workflow_execution_id: &str) -> bool {
        let flagged = {
            let cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
            match cancels.get(workflow_execution_id) {
                Some(flag) => {
                    flag.store(true, Ordering::SeqCst);
                    true
                }
                None => false,
            }
        };
        if flagged {
            let hit = self
                .registry
                .cancel_by_node_prefix(&format!("{}:", workflow_execution_id));
            tracing::info!(
                "[Workflow] Cancellation requested for run {} ({} in-flight node execution(s))",
                workflow_execution_id,
                hit
            );
        }
        flagged
    }

    pub async fn run_status(
        &self,
        workflow_execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, EngineError> {
        self.workflows.get_run(workflow_execution_id).await
    }

    // ─── Internals ──────────────────────────────────────────────────────

    async fn prepare(
        &self,
        workflow_id: &str,
        _payload: &serde_json::Value,
    ) -> Result<(WorkflowExecution, WorkflowDef, WorkflowGraph), EngineError> {
        let stored = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Workflow {} not found", workflow_id)))?;
        if !stored.enabled {
            return Err(EngineError::BadRequest(format!(
                "Workflow {} is disabled",
                workflow_id
            )));
        }

        // Cycle / shape validation happens before the run record exists.
        let graph = WorkflowGraph::build(&stored.definition)?;

        let run = WorkflowExecution::new(workflow_id);
        self.workflows.create_run(&run).await?;
        Ok((run, stored.definition, graph))
    }

    async fn drive(
        &self,
        mut run: WorkflowExecution,
        def: WorkflowDef,
        graph: WorkflowGraph,
        payload: serde_json::Value,
    ) -> Result<WorkflowExecution, EngineError> {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.id.clone(), cancel_flag.clone());

        let started_at = Utc::now();
        run.status = ExecutionStatus::Running;
        run.started_at = Some(started_at);
        self.workflows
            .update_run(&run.id, ExecutionStatus::Running, None, Some(started_at), None)
            .await?;
        tracing::info!(
            "[Workflow] Run {} started ({} nodes, order: {:?})",
            run.id,
            graph.order.len(),
            graph.order
        );

        let initial = WorkflowMessage::from_payload(payload);
        let mut outcomes: HashMap<String, NodeOutcome> = HashMap::new();
        let mut outputs: HashMap<String, WorkflowMessage> = HashMap::new();
        let mut text_outputs: HashMap<String, String> = HashMap::new();
        let mut decisions: HashMap<String, bool> = HashMap::new();
        let mut any_failed = false;
        let mut halted = false;

        for node_id in &graph.order {
            if cancel_flag.load(Ordering::SeqCst) {
                halted = true;
                break;
            }

            let node = def
                .get_node(node_id)
                .ok_or_else(|| EngineError::Internal(format!("Node {} vanished", node_id)))?;

            match self.gate(node_id, &graph, &outcomes, &decisions) {
                Gate::Run => {}
                Gate::SkipFailure => {
                    outcomes.insert(node_id.clone(), NodeOutcome::SkippedFailure);
                    self.record_unrun(&run.id, node_id, "upstream failed").await?;
                    continue;
                }
                Gate::Prune => {
                    outcomes.insert(node_id.clone(), NodeOutcome::Pruned);
                    self.record_unrun(&run.id, node_id, "branch pruned").await?;
                    continue;
                }
            }

            let input = self.gather_input(node_id, &graph, &outcomes, &decisions, &outputs, &initial);

            let mut node_exec = NodeExecution::new(&run.id, node_id);
            node_exec.status = ExecutionStatus::Running;
            node_exec.input_message = Some(input.clone());
            node_exec.started_at = Some(Utc::now());
            self.workflows.create_node_run(&node_exec).await?;

            let result = self
                .run_node(&run.id, node, &input, &text_outputs, &mut decisions)
                .await;

            node_exec.finished_at = Some(Utc::now());
            match result {
                Ok((message, text)) => {
                    node_exec.status = ExecutionStatus::Completed;
                    node_exec.output_message = Some(message.clone());
                    self.workflows.update_node_run(&node_exec).await?;
                    outcomes.insert(node_id.clone(), NodeOutcome::Completed);
                    outputs.insert(node_id.clone(), message);
                    text_outputs.insert(node_id.clone(), text);
                }
                Err(err) => {
                    tracing::warn!("[Workflow] Node {} failed: {}", node_id, err);
                    node_exec.status = ExecutionStatus::Failed;
                    node_exec.error = Some(err);
                    self.workflows.update_node_run(&node_exec).await?;
                    outcomes.insert(node_id.clone(), NodeOutcome::Failed);
                    any_failed = true;
                    if def.fail_fast {
                        halted = true;
                        break;
                    }
                }
            }
        }

        let cancelled = cancel_flag.load(Ordering::SeqCst);
        let (status, error) = if cancelled {
            (ExecutionStatus::Cancelled, Some("cancelled".to_string()))
        } else if any_failed || halted {
            let failed: Vec<&str> = outcomes
                .iter()
                .filter(|(_, o)| **o == NodeOutcome::Failed)
                .map(|(id, _)| id.as_str())
                .collect();
            (
                ExecutionStatus::Failed,
                Some(format!("node(s) failed: {}", failed.join(", "))),
            )
        } else {
            (ExecutionStatus::Completed, None)
        };

        let finished_at = Utc::now();
        run.status = status;
        run.error = error.clone();
        run.finished_at = Some(finished_at);
        self.workflows
            .update_run(&run.id, status, error, None, Some(finished_at))
            .await?;
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run.id);

        tracing::info!("[Workflow] Run {} finished: {}", run.id, status.as_str());
        Ok(run)
    }

    /// Decide whether a node runs, given its parents' outcomes.
    fn gate(
        &self,
        node_id: &str,
        graph: &WorkflowGraph,
        outcomes: &HashMap<String, NodeOutcome>,
        decisions: &HashMap<String, bool>,
    ) -> Gate {
        let Some(preds) = graph.predecessors.get(node_id) else {
            return Gate::Run;
        };
        if preds.is_empty() {
            return Gate::Run;
        }

        let mut delivered = false;
        for (source, branch) in preds {
            match outcomes.get(source) {
                Some(NodeOutcome::Failed) | Some(NodeOutcome::SkippedFailure) => {
                    return Gate::SkipFailure;
                }
                Some(NodeOutcome::Pruned) => {}
                Some(NodeOutcome::Completed) => {
                    let taken = match branch {
                        Some(wanted) => decisions.get(source) == Some(wanted),
                        None => true,
                    };
                    if taken {
                        delivered = true;
                    }
                }
                // Upstream never ran (cancelled mid-run): treat as skip.
                None => return Gate::SkipFailure,
            }
        }

        if delivered {
            Gate::Run
        } else {
            Gate::Prune
        }
    }

    /// Merge the envelopes of delivering parents in topological order:
    /// variables union (later parents win), payload from the last one.
    fn gather_input(
        &self,
        node_id: &str,
        graph: &WorkflowGraph,
        outcomes: &HashMap<String, NodeOutcome>,
        decisions: &HashMap<String, bool>,
        outputs: &HashMap<String, WorkflowMessage>,
        initial: &WorkflowMessage,
    ) -> WorkflowMessage {
        let Some(preds) = graph.predecessors.get(node_id) else {
            return initial.clone();
        };
        if preds.is_empty() {
            return initial.clone();
        }

        let delivering: HashSet<&str> = preds
            .iter()
            .filter(|(source, branch)| {
                outcomes.get(source) == Some(&NodeOutcome::Completed)
                    && match branch {
                        Some(wanted) => decisions.get(source) == Some(wanted),
                        None => true,
                    }
            })
            .map(|(source, _)| source.as_str())
            .collect();

        let mut merged = initial.clone();
        for source in graph.order.iter().filter(|id| delivering.contains(id.as_str())) {
            if let Some(msg) = outputs.get(source) {
                merged.payload = msg.payload.clone();
                merged.variables.extend(msg.variables.clone());
            }
        }
        merged
    }

    /// Persist a row for a node that never ran (pruned or upstream failure).
    async fn record_unrun(
        &self,
        run_id: &str,
        node_id: &str,
        why: &str,
    ) -> Result<(), EngineError> {
        let mut node_exec = NodeExecution::new(run_id, node_id);
        node_exec.status = ExecutionStatus::Cancelled;
        node_exec.error = Some(why.to_string());
        node_exec.finished_at = Some(Utc::now());
        self.workflows.create_node_run(&node_exec).await
    }

    /// Execute one node. Returns the output envelope plus the node's text
    /// output (for `${nodes.<id>.output}` templates).
    async fn run_node(
        &self,
        run_id: &str,
        node: &NodeDef,
        input: &WorkflowMessage,
        text_outputs: &HashMap<String, String>,
        decisions: &mut HashMap<String, bool>,
    ) -> Result<(WorkflowMessage, String), String> {
        let node_ref = format!("{}:{}", run_id, node.id);
        match node.kind {
            NodeKind::Trigger => {
                let trigger_id = node
                    .trigger_id
                    .as_deref()
                    .ok_or_else(|| format!("node {} has no triggerId", node.id))?;
                let execution = self
                    .router
                    .execute_trigger_as_node(trigger_id, input.payload.clone(), "workflow", node_ref)
                    .await
                    .map_err(|e| e.to_string())?;
                self.agent_outcome(execution, input).await
            }
            NodeKind::Agent => {
                let template = node
                    .prompt
                    .as_deref()
                    .ok_or_else(|| format!("node {} has no prompt", node.id))?;
                let prompt = self.resolve_template(template, input, text_outputs);
                let spec = DispatchSpec {
                    trigger_id: format!("node:{}", node.id),
                    node_ref: Some(node_ref),
                    prompt_template: prompt,
                    working_dir: ".".to_string(),
                    fallback_chain: node.fallback_chain.clone(),
                    budget_limit_microusd: None,
                    grace_kill: Duration::from_secs(5),
                };
                let execution = self
                    .router
                    .execute_spec(spec, input.payload.clone(), "workflow")
                    .await
                    .map_err(|e| e.to_string())?;
                self.agent_outcome(execution, input).await
            }
            NodeKind::Skill | NodeKind::Command | NodeKind::Script => {
                let run = node
                    .run
                    .as_deref()
                    .ok_or_else(|| format!("node {} has no run", node.id))?;
                let mut command_line = self.resolve_template(run, input, text_outputs);
                if node.kind == NodeKind::Skill {
                    // Skills resolve against the installed-tools PATH.
                    if let Some((head, rest)) = command_line.split_once(char::is_whitespace) {
                        if let Some(resolved) = shell_env::which(head) {
                            command_line = format!("{} {}", resolved, rest);
                        }
                    } else if let Some(resolved) = shell_env::which(&command_line) {
                        command_line = resolved;
                    }
                }
                let text = run_bounded_shell(&command_line, node.timeout_secs).await?;
                Ok((
                    WorkflowMessage {
                        payload: serde_json::Value::String(text.clone()),
                        variables: input.variables.clone(),
                    },
                    text,
                ))
            }
            NodeKind::Conditional => {
                let template = node
                    .when
                    .as_deref()
                    .ok_or_else(|| format!("node {} has no when", node.id))?;
                let resolved = self.resolve_template(template, input, text_outputs);
                let decision = evaluate_predicate(&resolved);
                decisions.insert(node.id.clone(), decision);
                tracing::debug!(
                    "[Workflow] Conditional {} evaluated '{}' → {}",
                    node.id,
                    resolved,
                    decision
                );
                Ok((input.clone(), decision.to_string()))
            }
            NodeKind::Transform => {
                let mut message = input.clone();
                let mut keys: Vec<&String> = node.set.keys().collect();
                keys.sort();
                for key in keys {
                    let value =
                        self.resolve_template(&node.set[key], &message, text_outputs);
                    message.variables.insert(key.clone(), value);
                }
                Ok((message.clone(), String::new()))
            }
        }
    }

    /// Map a router execution into a node outcome, pulling the stdout text
    /// from the durable log archive as the node's output.
    async fn agent_outcome(
        &self,
        execution: crate::models::execution::Execution,
        input: &WorkflowMessage,
    ) -> Result<(WorkflowMessage, String), String> {
        if execution.status != ExecutionStatus::Completed {
            return Err(format!(
                "execution {} terminated {}{}",
                execution.id,
                execution.status.as_str(),
                execution
                    .reason
                    .as_deref()
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            ));
        }
        let text = self
            .logs
            .list(&execution.id)
            .await
            .map_err(|e| e.to_string())?
            .into_iter()
            .filter(|l| l.stream == crate::models::execution::LogStream::Stdout)
            .map(|l| l.text)
            .collect::<Vec<_>>()
            .join("\n");
        Ok((
            WorkflowMessage {
                payload: serde_json::Value::String(text.clone()),
                variables: input.variables.clone(),
            },
            text,
        ))
    }

    /// Substitute `${payload…}`, `${variables.<k>}` and `${nodes.<id>.output}`
    /// references.
    fn resolve_template(
        &self,
        template: &str,
        message: &WorkflowMessage,
        text_outputs: &HashMap<String, String>,
    ) -> String {
        let mut result = render_prompt(template, &message.payload);

        let var_re = Regex::new(r"\$\{variables\.([^}]+)\}").expect("variables pattern is valid");
        result = var_re
            .replace_all(&result, |caps: &regex::Captures| {
                message
                    .variables
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .to_string();

        let node_re =
            Regex::new(r"\$\{nodes\.([^.}]+)\.output\}").expect("nodes pattern is valid");
        result = node_re
            .replace_all(&result, |caps: &regex::Captures| {
                text_outputs
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .to_string();

        result
    }
}

enum Gate {
    Run,
    SkipFailure,
    Prune,
}

/// Run a shell command with a hard timeout, capturing stdout.
/// `kill_on_drop` reaps the child if the timeout fires.
async fn run_bounded_shell(command_line: &str, timeout_secs: u64) -> Result<String, String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(Duration::from_secs(timeout_secs.max(1)), cmd.output()).await {
        Err(_) => Err(format!("timed out after {}s", timeout_secs)),
        Ok(Err(e)) => Err(format!("spawn failed: {}", e)),
        Ok(Ok(output)) => {
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
            } else {
                Err(format!(
                    "exit code {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ))
            }
        }
    }
}

/// Predicate semantics: `a == b` / `a != b` compare trimmed operands; any
/// other expression is truthy unless empty, "false", or "0".
fn evaluate_predicate(expr: &str) -> bool {
    if let Some((lhs, rhs)) = expr.split_once("==") {
        return lhs.trim() == rhs.trim();
    }
    if let Some((lhs, rhs)) = expr.split_once("!=") {
        return lhs.trim() != rhs.trim();
    }
    let t = expr.trim();
    !(t.is_empty() || t == "false" || t == "0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::engine::coordinator::ExecutionCoordinator;
    use crate::engine::logs::LogHub;
    use crate::engine::ratelimit::RegexRateLimitMatcher;
    use crate::store::{AccountStore, ExecutionStore, RetryStore, TriggerStore};

    fn runner() -> (Arc<WorkflowRunner>, WorkflowStore) {
        let db = Database::open_in_memory().unwrap();
        let workflows = WorkflowStore::new(db.clone());
        let executions = ExecutionStore::new(db.clone());
        let logs = LogStore::new(db.clone());
        let registry = ProcessRegistry::new();
        let coordinator = Arc::new(ExecutionCoordinator::new(
            registry.clone(),
            Arc::new(LogHub::new()),
            executions.clone(),
            logs.clone(),
            Arc::new(RegexRateLimitMatcher::new()),
        ));
        let router = Arc::new(FallbackRouter::new(
            coordinator,
            TriggerStore::new(db.clone()),
            AccountStore::new(db.clone()),
            executions,
            RetryStore::new(db),
        ));
        let runner = Arc::new(WorkflowRunner::new(workflows.clone(), router, logs, registry));
        (runner, workflows)
    }

    async fn store_yaml(workflows: &WorkflowStore, yaml: &str) -> String {
        let def = WorkflowDef::from_yaml(yaml).unwrap();
        workflows.create(def).await.unwrap().id
    }

    #[tokio::test]
    async fn diamond_runs_in_document_topo_order() {
        let (runner, workflows) = runner();
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("order.log");
        let yaml = format!(
            r#"
name: "Diamond"
nodes:
  - {{ id: a, kind: command, run: "echo a >> {path}" }}
  - {{ id: b, kind: command, run: "echo b >> {path}" }}
  - {{ id: c, kind: command, run: "echo c >> {path}" }}
  - {{ id: d, kind: command, run: "echo d >> {path}" }}
edges:
  - {{ from: a, to: b }}
  - {{ from: a, to: c }}
  - {{ from: b, to: d }}
  - {{ from: c, to: d }}
"#,
            path = log.display()
        );
        let id = store_yaml(&workflows, &yaml).await;

        let run = runner
            .run_to_completion(&id, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(run.status, ExecutionStatus::Completed);

        let written = std::fs::read_to_string(&log).unwrap();
        assert_eq!(written, "a\nb\nc\nd\n");

        let nodes = workflows.list_node_runs(&run.id).await.unwrap();
        assert_eq!(nodes.len(), 4);
        assert!(nodes.iter().all(|n| n.status == ExecutionStatus::Completed));

        // d started only after both b and c finished
        let finished = |id: &str| {
            nodes
                .iter()
                .find(|n| n.node_id == id)
                .and_then(|n| n.finished_at)
                .unwrap()
        };
        let d_started = nodes
            .iter()
            .find(|n| n.node_id == "d")
            .and_then(|n| n.started_at)
            .unwrap();
        assert!(d_started >= finished("b"));
        assert!(d_started >= finished("c"));
    }

    #[tokio::test]
    async fn cycle_is_rejected_with_zero_node_executions() {
        let (runner, workflows) = runner();
        let id = store_yaml(
            &workflows,
            r#"
name: "Cyclic"
nodes:
  - { id: a, kind: command, run: "true" }
  - { id: b, kind: command, run: "true" }
edges:
  - { from: a, to: b }
  - { from: b, to: a }
"#,
        )
        .await;

        let err = runner
            .run_to_completion(&id, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let runs = workflows.list_runs(&id).await.unwrap();
        assert!(runs.is_empty(), "no run record may exist for a cyclic graph");
    }

    #[tokio::test]
    async fn conditional_prunes_the_untaken_branch() {
        let (runner, workflows) = runner();
        let dir = tempfile::tempdir().unwrap();
        let taken = dir.path().join("taken");
        let pruned = dir.path().join("pruned");
        let yaml = format!(
            r#"
name: "Branch"
nodes:
  - id: tag
    kind: transform
    set:
      category: bug
  - id: gate
    kind: conditional
    when: "${{variables.category}} == bug"
  - {{ id: yes-branch, kind: command, run: "touch {taken}" }}
  - {{ id: no-branch, kind: command, run: "touch {pruned}" }}
  - {{ id: after-no, kind: command, run: "touch {pruned}.after" }}
edges:
  - {{ from: tag, to: gate }}
  - {{ from: gate, to: yes-branch, branch: true }}
  - {{ from: gate, to: no-branch, branch: false }}
  - {{ from: no-branch, to: after-no }}
"#,
            taken = taken.display(),
            pruned = pruned.display()
        );
        let id = store_yaml(&workflows, &yaml).await;

        let run = runner
            .run_to_completion(&id, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(run.status, ExecutionStatus::Completed);

        assert!(taken.exists());
        assert!(!pruned.exists(), "untaken branch must not run");

        let nodes = workflows.list_node_runs(&run.id).await.unwrap();
        let by_id = |nid: &str| nodes.iter().find(|n| n.node_id == nid).unwrap();
        assert_eq!(by_id("yes-branch").status, ExecutionStatus::Completed);
        assert_eq!(by_id("no-branch").status, ExecutionStatus::Cancelled);
        assert_eq!(by_id("no-branch").error.as_deref(), Some("branch pruned"));
        // Pruning is transitive
        assert_eq!(by_id("after-no").status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn node_failure_halts_branch_but_not_siblings() {
        let (runner, workflows) = runner();
        let dir = tempfile::tempdir().unwrap();
        let sibling = dir.path().join("sibling");
        let orphan = dir.path().join("orphan");
        let yaml = format!(
            r#"
name: "Isolation"
nodes:
  - {{ id: root, kind: command, run: "true" }}
  - {{ id: broken, kind: command, run: "exit 7" }}
  - {{ id: healthy, kind: command, run: "touch {sibling}" }}
  - {{ id: downstream, kind: command, run: "touch {orphan}" }}
edges:
  - {{ from: root, to: broken }}
  - {{ from: root, to: healthy }}
  - {{ from: broken, to: downstream }}
"#,
            sibling = sibling.display(),
            orphan = orphan.display()
        );
        let id = store_yaml(&workflows, &yaml).await;

        let run = runner
            .run_to_completion(&id, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(run.status, ExecutionStatus::Failed);
        assert!(run.error.unwrap().contains("broken"));

        assert!(sibling.exists(), "sibling branch must still run");
        assert!(!orphan.exists(), "failed branch must halt");

        let nodes = workflows.list_node_runs(&run.id).await.unwrap();
        let by_id = |nid: &str| nodes.iter().find(|n| n.node_id == nid).unwrap();
        assert_eq!(by_id("healthy").status, ExecutionStatus::Completed);
        assert_eq!(by_id("broken").status, ExecutionStatus::Failed);
        assert_eq!(by_id("downstream").status, ExecutionStatus::Cancelled);
        assert_eq!(by_id("downstream").error.as_deref(), Some("upstream failed"));
    }

    #[tokio::test]
    async fn fail_fast_halts_the_whole_run() {
        let (runner, workflows) = runner();
        let dir = tempfile::tempdir().unwrap();
        let later = dir.path().join("later");
        let yaml = format!(
            r#"
name: "FailFast"
failFast: true
nodes:
  - {{ id: broken, kind: command, run: "exit 1" }}
  - {{ id: independent, kind: command, run: "touch {later}" }}
"#,
            later = later.display()
        );
        let id = store_yaml(&workflows, &yaml).await;

        let run = runner
            .run_to_completion(&id, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(run.status, ExecutionStatus::Failed);
        assert!(
            !later.exists(),
            "fail-fast must stop even independent branches"
        );
    }

    #[tokio::test]
    async fn templates_flow_payload_and_variables_through_nodes() {
        let (runner, workflows) = runner();
        let id = store_yaml(
            &workflows,
            r#"
name: "Templates"
nodes:
  - { id: greet, kind: command, run: "echo hello ${payload.name}" }
  - id: tag
    kind: transform
    set:
      shout: "${nodes.greet.output}!"
  - { id: out, kind: command, run: "echo ${variables.shout}" }
edges:
  - { from: greet, to: tag }
  - { from: tag, to: out }
"#,
        )
        .await;

        let run = runner
            .run_to_completion(&id, serde_json::json!({"name": "world"}))
            .await
            .unwrap();
        assert_eq!(run.status, ExecutionStatus::Completed);

        let nodes = workflows.list_node_runs(&run.id).await.unwrap();
        let out = nodes.iter().find(|n| n.node_id == "out").unwrap();
        let output = out.output_message.as_ref().unwrap();
        assert_eq!(
            output.payload,
            serde_json::Value::String("hello world!".to_string())
        );
    }

    #[test]
    fn predicate_semantics() {
        assert!(evaluate_predicate("bug == bug"));
        assert!(!evaluate_predicate("bug == feature"));
        assert!(evaluate_predicate("a != b"));
        assert!(!evaluate_predicate(""));
        assert!(!evaluate_predicate("false"));
        assert!(!evaluate_predicate("0"));
        assert!(evaluate_predicate("anything"));
    }
}
