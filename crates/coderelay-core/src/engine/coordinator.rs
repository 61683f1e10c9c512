//! Execution coordinator — owns the lifecycle of one external-process
//! invocation.
//!
//! Per execution the coordinator runs:
//!   1. command construction + spawn (own process group)
//!   2. a stdout drain task (also tracks accumulated cost)
//!   3. a stderr drain task (runs the rate-limit classifier per line)
//!   4. a budget monitor task (fixed-interval poll against the hard limit)
//!   5. a waiter: blocks on exit, joins the drains, flushes buffered lines
//!      to the durable store, finalizes the terminal status
//!
//! The coordinator never raises across its public boundary: every terminal
//! state is a status value with a machine-readable reason string.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::engine::command::{extract_cost_microusd, CommandSpec};
use crate::engine::logs::LogHub;
use crate::engine::ratelimit::RateLimitMatcher;
use crate::engine::registry::{ProcessHandle, ProcessRegistry};
use crate::error::EngineError;
use crate::models::execution::{reason, Execution, ExecutionStatus, LogLine, LogStream};
use crate::shell_env;
use crate::store::execution_store::StatusUpdate;
use crate::store::{ExecutionStore, LogStore};

/// Everything needed to start one supervised invocation.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub trigger_id: Option<String>,
    /// `<workflow_execution_id>:<node_id>` when spawned by the DAG executor.
    pub node_ref: Option<String>,
    pub account_id: Option<String>,
    pub command: CommandSpec,
    /// Hard spend ceiling in micro-USD; `None` disables the budget monitor.
    pub budget_limit_microusd: Option<i64>,
    /// Already-spent budget counted against the limit before this run.
    pub budget_spent_microusd: i64,
    pub grace_kill: Duration,
}

/// Handle to an in-flight execution. `wait` resolves at the terminal
/// transition with the final record.
pub struct RunningExecution {
    pub execution_id: String,
    done: oneshot::Receiver<Execution>,
}

impl RunningExecution {
    pub async fn wait(self) -> Result<Execution, EngineError> {
        self.done
            .await
            .map_err(|_| EngineError::Internal("Execution finalizer dropped".to_string()))
    }
}

/// Tunables for the coordinator's monitor loops.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub budget_poll_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            budget_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Owns command construction, spawn, stream draining, rate-limit detection,
/// budget enforcement, and completion/failure finalization.
pub struct ExecutionCoordinator {
    registry: ProcessRegistry,
    hub: Arc<LogHub>,
    executions: ExecutionStore,
    logs: LogStore,
    matcher: Arc<dyn RateLimitMatcher>,
    config: CoordinatorConfig,
}

impl ExecutionCoordinator {
    pub fn new(
        registry: ProcessRegistry,
        hub: Arc<LogHub>,
        executions: ExecutionStore,
        logs: LogStore,
        matcher: Arc<dyn RateLimitMatcher>,
    ) -> Self {
        Self {
            registry,
            hub,
            executions,
            logs,
            matcher,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn one supervised invocation. Returns as soon as the process is
    /// running (or has terminally failed to spawn); the returned handle's
    /// `wait` resolves at the terminal transition.
    pub async fn start(&self, req: StartRequest) -> Result<RunningExecution, EngineError> {
        let mut execution = Execution::new(req.trigger_id.clone(), req.node_ref.clone());
        execution.account_id = req.account_id.clone();
        let execution_id = execution.id.clone();

        self.executions.create(&execution).await?;
        self.hub.start_execution(&execution_id);

        let (done_tx, done_rx) = oneshot::channel();

        // Resolve the program against the full shell PATH; a server started
        // from a systemd unit or launcher won't find user CLIs otherwise.
        let program = shell_env::which(&req.command.program)
            .unwrap_or_else(|| req.command.program.clone());

        let mut cmd = Command::new(&program);
        cmd.args(&req.command.args)
            .current_dir(&req.command.working_dir)
            .env("PATH", shell_env::full_path())
            .envs(&req.command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    "[Coordinator] Spawn failed for execution {} ({}): {}",
                    execution_id,
                    program,
                    e
                );
                let finished = self
                    .finalize(
                        execution,
                        ExecutionStatus::Failed,
                        Some(reason::SPAWN_FAILURE.to_string()),
                        None,
                        0,
                        Vec::new(),
                    )
                    .await?;
                let _ = done_tx.send(finished);
                return Ok(RunningExecution {
                    execution_id,
                    done: done_rx,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        let handle = ProcessHandle::new(pid, req.node_ref.clone());
        self.registry.register(&execution_id, handle.clone())?;

        let started_at = Utc::now();
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(started_at);
        self.executions
            .update_status(
                &execution_id,
                ExecutionStatus::Running,
                StatusUpdate {
                    started_at: Some(started_at),
                    ..Default::default()
                },
            )
            .await?;
        self.hub.status(&execution_id, ExecutionStatus::Running);

        tracing::info!(
            "[Coordinator] Execution {} running: {} {} (pid {})",
            execution_id,
            program,
            req.command.args.join(" "),
            pid
        );

        let cost = Arc::new(AtomicI64::new(0));
        let rate_limited = Arc::new(AtomicBool::new(false));
        let budget_exceeded = Arc::new(AtomicBool::new(false));
        let collected: Arc<Mutex<Vec<LogLine>>> = Arc::new(Mutex::new(Vec::new()));

        // Stdout drain: every line goes to the hub; stream-json result lines
        // carry the running cost.
        let stdout = child.stdout.take();
        let stdout_task = {
            let hub = self.hub.clone();
            let id = execution_id.clone();
            let cost = cost.clone();
            let collected = collected.clone();
            tokio::spawn(async move {
                let Some(stdout) = stdout else { return };
                let reader = BufReader::new(stdout);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(c) = extract_cost_microusd(&line) {
                        cost.store(c, Ordering::SeqCst);
                    }
                    if let Some(stamped) = hub.append(&id, LogStream::Stdout, line) {
                        collected.lock().unwrap_or_else(|e| e.into_inner()).push(stamped);
                    }
                }
            })
        };

        // Stderr drain: same fan-out, plus rate-limit classification. On a
        // hit the process group is terminated; the fallback router owns the
        // retry, not this loop.
        let stderr = child.stderr.take();
        let stderr_task = {
            let hub = self.hub.clone();
            let id = execution_id.clone();
            let matcher = self.matcher.clone();
            let rate_limited = rate_limited.clone();
            let handle = handle.clone();
            let collected = collected.clone();
            tokio::spawn(async move {
                let Some(stderr) = stderr else { return };
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !rate_limited.load(Ordering::SeqCst) {
                        if let Some(signal) = matcher.classify(&line) {
                            tracing::warn!(
                                "[Coordinator] Rate limit detected on execution {}: {}",
                                id,
                                signal.line
                            );
                            rate_limited.store(true, Ordering::SeqCst);
                            handle.request_terminate();
                        }
                    }
                    if let Some(stamped) = hub.append(&id, LogStream::Stderr, line) {
                        collected.lock().unwrap_or_else(|e| e.into_inner()).push(stamped);
                    }
                }
            })
        };

        // Budget monitor: fixed-interval poll of the accumulated spend.
        let budget_task = req.budget_limit_microusd.map(|limit| {
            let id = execution_id.clone();
            let cost = cost.clone();
            let spent_before = req.budget_spent_microusd;
            let budget_exceeded = budget_exceeded.clone();
            let handle = handle.clone();
            let interval = self.config.budget_poll_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let total = spent_before + cost.load(Ordering::SeqCst);
                    if total >= limit {
                        tracing::warn!(
                            "[Coordinator] Budget exceeded on execution {} ({} >= {} µUSD)",
                            id,
                            total,
                            limit
                        );
                        budget_exceeded.store(true, Ordering::SeqCst);
                        handle.request_terminate();
                        break;
                    }
                }
            })
        });

        // Waiter: blocks on exit (with the terminate → grace → kill
        // escalation), joins the drains, flushes, finalizes.
        let coordinator = self.clone_parts();
        let grace = req.grace_kill;
        tokio::spawn(async move {
            let status = wait_with_termination(child, handle.clone(), grace).await;

            let _ = stdout_task.await;
            let _ = stderr_task.await;
            if let Some(task) = budget_task {
                task.abort();
            }

            let exit_code = status.as_ref().ok().and_then(|s| s.code());
            let exited_ok = status.as_ref().map(|s| s.success()).unwrap_or(false);

            let (terminal, term_reason) = if rate_limited.load(Ordering::SeqCst) {
                (ExecutionStatus::RateLimited, Some(reason::RATE_LIMITED.to_string()))
            } else if budget_exceeded.load(Ordering::SeqCst) {
                (ExecutionStatus::Failed, Some(reason::BUDGET_EXCEEDED.to_string()))
            } else if handle.cancel_requested() {
                (ExecutionStatus::Cancelled, Some(reason::CANCELLED.to_string()))
            } else if exited_ok {
                (ExecutionStatus::Completed, None)
            } else {
                (ExecutionStatus::Failed, Some(reason::NONZERO_EXIT.to_string()))
            };

            let lines = std::mem::take(
                &mut *collected.lock().unwrap_or_else(|e| e.into_inner()),
            );
            let final_cost = cost.load(Ordering::SeqCst);

            coordinator.registry.remove(&execution.id);
            match coordinator
                .finalize(execution, terminal, term_reason, exit_code, final_cost, lines)
                .await
            {
                Ok(finished) => {
                    let _ = done_tx.send(finished);
                }
                Err(e) => {
                    tracing::error!("[Coordinator] Finalize failed: {}", e);
                }
            }
        });

        Ok(RunningExecution {
            execution_id,
            done: done_rx,
        })
    }

    /// Request cooperative cancellation. Returns false when the execution
    /// has no live process.
    pub fn cancel(&self, execution_id: &str) -> bool {
        self.registry.cancel(execution_id)
    }

    /// Current persisted record for an execution.
    pub async fn status(&self, execution_id: &str) -> Result<Option<Execution>, EngineError> {
        self.executions.get(execution_id).await
    }

    fn clone_parts(&self) -> FinalizeParts {
        FinalizeParts {
            registry: self.registry.clone(),
            hub: self.hub.clone(),
            executions: self.executions.clone(),
            logs: self.logs.clone(),
        }
    }
}

/// The subset of coordinator state the waiter task needs.
struct FinalizeParts {
    registry: ProcessRegistry,
    hub: Arc<LogHub>,
    executions: ExecutionStore,
    logs: LogStore,
}

impl FinalizeParts {
    /// Terminal transition: durable record update, log flush, hub marker.
    async fn finalize(
        &self,
        mut execution: Execution,
        status: ExecutionStatus,
        term_reason: Option<String>,
        exit_code: Option<i32>,
        cost_microusd: i64,
        lines: Vec<LogLine>,
    ) -> Result<Execution, EngineError> {
        let finished_at = Utc::now();
        execution.status = status;
        execution.reason = term_reason.clone();
        execution.exit_code = exit_code;
        execution.cost_microusd = cost_microusd;
        execution.finished_at = Some(finished_at);

        self.logs.flush(lines).await?;
        self.executions
            .update_status(
                &execution.id,
                status,
                StatusUpdate {
                    reason: term_reason.clone(),
                    exit_code,
                    cost_microusd: Some(cost_microusd),
                    finished_at: Some(finished_at),
                    ..Default::default()
                },
            )
            .await?;
        self.hub.finish_execution(&execution.id, status, term_reason);

        tracing::info!(
            "[Coordinator] Execution {} finished: {} (exit: {:?}, cost: {} µUSD)",
            execution.id,
            status.as_str(),
            exit_code,
            cost_microusd
        );
        Ok(execution)
    }
}

impl ExecutionCoordinator {
    async fn finalize(
        &self,
        execution: Execution,
        status: ExecutionStatus,
        term_reason: Option<String>,
        exit_code: Option<i32>,
        cost_microusd: i64,
        lines: Vec<LogLine>,
    ) -> Result<Execution, EngineError> {
        self.clone_parts()
            .finalize(execution, status, term_reason, exit_code, cost_microusd, lines)
            .await
    }
}

/// Wait for the child to exit. If termination is requested first, send the
/// graceful signal, give the process its grace period, then escalate to a
/// forceful kill.
async fn wait_with_termination(
    mut child: Child,
    handle: Arc<ProcessHandle>,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    let terminate_requested = tokio::select! {
        status = child.wait() => return status,
        _ = handle.terminate_wait() => true,
    };

    if terminate_requested {
        if !handle.signal_graceful() {
            // No process-group signalling on this platform; fall back to
            // killing the direct child.
            let _ = child.start_kill();
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => {
                tracing::warn!(
                    "[Coordinator] Grace period elapsed for pid {}; escalating to SIGKILL",
                    handle.pid
                );
                if !handle.signal_forceful() {
                    let _ = child.start_kill();
                }
            }
        }
    }
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::engine::ratelimit::RegexRateLimitMatcher;

    fn coordinator() -> (ExecutionCoordinator, ExecutionStore, Arc<LogHub>) {
        let db = Database::open_in_memory().unwrap();
        let executions = ExecutionStore::new(db.clone());
        let logs = LogStore::new(db);
        let hub = Arc::new(LogHub::new());
        let coordinator = ExecutionCoordinator::new(
            ProcessRegistry::new(),
            hub.clone(),
            executions.clone(),
            logs,
            Arc::new(RegexRateLimitMatcher::new()),
        );
        (coordinator, executions, hub)
    }

    fn shell_request(script: &str) -> StartRequest {
        StartRequest {
            trigger_id: Some("trig-1".to_string()),
            node_ref: None,
            account_id: Some("acc-1".to_string()),
            command: CommandSpec::for_shell(script, "."),
            budget_limit_microusd: None,
            budget_spent_microusd: 0,
            grace_kill: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn successful_run_completes_with_exit_zero() {
        let (coordinator, store, _) = coordinator();
        let running = coordinator
            .start(shell_request("echo hello; echo world"))
            .await
            .unwrap();
        let finished = running.wait().await.unwrap();

        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert_eq!(finished.exit_code, Some(0));
        assert!(finished.started_at.is_some());
        assert!(finished.finished_at.is_some());

        let persisted = store.get(&finished.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_reason() {
        let (coordinator, _, _) = coordinator();
        let running = coordinator.start(shell_request("exit 3")).await.unwrap();
        let finished = running.wait().await.unwrap();

        assert_eq!(finished.status, ExecutionStatus::Failed);
        assert_eq!(finished.reason.as_deref(), Some(reason::NONZERO_EXIT));
        assert_eq!(finished.exit_code, Some(3));
    }

    #[tokio::test]
    async fn spawn_failure_is_terminal_without_registry_entry() {
        let (coordinator, store, _) = coordinator();
        let req = StartRequest {
            command: CommandSpec {
                program: "definitely-not-a-real-binary-xyz".to_string(),
                args: vec![],
                env: Default::default(),
                working_dir: ".".to_string(),
            },
            ..shell_request("true")
        };
        let running = coordinator.start(req).await.unwrap();
        let finished = running.wait().await.unwrap();

        assert_eq!(finished.status, ExecutionStatus::Failed);
        assert_eq!(finished.reason.as_deref(), Some(reason::SPAWN_FAILURE));

        let persisted = store.get(&finished.id).await.unwrap().unwrap();
        assert_eq!(persisted.reason.as_deref(), Some(reason::SPAWN_FAILURE));
    }

    #[tokio::test]
    async fn stderr_rate_limit_terminates_as_rate_limited() {
        let (coordinator, _, _) = coordinator();
        let running = coordinator
            .start(shell_request(
                "echo 'rate limit exceeded, retry later' 1>&2; sleep 30",
            ))
            .await
            .unwrap();
        let finished = running.wait().await.unwrap();

        assert_eq!(finished.status, ExecutionStatus::RateLimited);
        assert_eq!(finished.reason.as_deref(), Some(reason::RATE_LIMITED));
    }

    #[tokio::test]
    async fn cancel_is_cooperative_and_terminal() {
        let (coordinator, _, _) = coordinator();
        let running = coordinator.start(shell_request("sleep 30")).await.unwrap();
        let id = running.execution_id.clone();

        // Give the drain loops a beat to attach, then cancel.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coordinator.cancel(&id));

        let finished = running.wait().await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Cancelled);
        assert_eq!(finished.reason.as_deref(), Some(reason::CANCELLED));
        assert!(!coordinator.cancel(&id), "registry entry must be gone");
    }

    #[tokio::test]
    async fn budget_breach_cancels_with_budget_reason() {
        let (coordinator, _, _) = coordinator();
        let mut req = shell_request(
            r#"echo '{"type":"result","total_cost_usd":2.5}'; sleep 30"#,
        );
        req.budget_limit_microusd = Some(1_000_000);
        let running = coordinator.start(req).await.unwrap();
        let finished = running.wait().await.unwrap();

        assert_eq!(finished.status, ExecutionStatus::Failed);
        assert_eq!(finished.reason.as_deref(), Some(reason::BUDGET_EXCEEDED));
        assert_eq!(finished.cost_microusd, 2_500_000);
    }

    #[tokio::test]
    async fn log_lines_reach_hub_with_increasing_seq() {
        let (coordinator, _, hub) = coordinator();
        let running = coordinator
            .start(shell_request("echo one; echo two; echo three"))
            .await
            .unwrap();
        let id = running.execution_id.clone();
        let finished = running.wait().await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Completed);

        let sub = hub.subscribe(&id, None).unwrap();
        let seqs: Vec<u64> = sub.replay.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(sub.terminal.is_some());
    }
}
