//! Fallback router — selects which configured account an execution uses,
//! pre-checks spend budget, and rotates to the next account on provider
//! rate limits with persisted exponential-backoff retry state.
//!
//! Per-attempt state machine:
//!   candidate_selected → budget_checked → dispatched →
//!     { succeeded | rate_limited → rotate → candidate_selected | exhausted }
//!
//! Wrapping is forbidden: exhausting the chain is terminal, recorded as
//! `failed` with the distinguishable `chain_exhausted` reason.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::engine::command::CommandSpec;
use crate::engine::coordinator::{ExecutionCoordinator, StartRequest};
use crate::error::EngineError;
use crate::models::account::BackendAccount;
use crate::models::execution::{reason, Execution, ExecutionStatus};
use crate::models::retry::RetryState;
use crate::models::trigger::TriggerDef;
use crate::store::execution_store::StatusUpdate;
use crate::store::{AccountStore, ExecutionStore, RetryStore, TriggerStore};

/// Builds the concrete command line for an account + prompt. Injectable so
/// tests (and future backends) can swap the real agent CLIs out.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, account: &BackendAccount, prompt: &str, working_dir: &str) -> CommandSpec;
}

/// Production builder: the real agent CLI invocations.
pub struct AgentCommandBuilder;

impl CommandBuilder for AgentCommandBuilder {
    fn build(&self, account: &BackendAccount, prompt: &str, working_dir: &str) -> CommandSpec {
        CommandSpec::for_agent(account, prompt, working_dir)
    }
}

/// Backoff and cooldown tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// First retry delay; doubles per attempt.
    pub backoff_base_secs: u64,
    /// Ceiling for the doubled delay.
    pub backoff_cap_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: 30,
            backoff_cap_secs: 3600,
        }
    }
}

/// A unit of work the router can dispatch: either a configured trigger or
/// an inline workflow-node spec.
#[derive(Debug, Clone)]
pub struct DispatchSpec {
    pub trigger_id: String,
    pub node_ref: Option<String>,
    pub prompt_template: String,
    pub working_dir: String,
    pub fallback_chain: Vec<String>,
    pub budget_limit_microusd: Option<i64>,
    pub grace_kill: Duration,
}

impl DispatchSpec {
    pub fn from_trigger(trigger: &TriggerDef) -> Self {
        Self {
            trigger_id: trigger.id.clone(),
            node_ref: None,
            prompt_template: trigger.prompt_template.clone(),
            working_dir: trigger.working_dir.clone(),
            fallback_chain: trigger.fallback_chain.clone(),
            budget_limit_microusd: trigger.budget_limit_microusd,
            grace_kill: Duration::from_secs(trigger.grace_kill_secs),
        }
    }
}

/// Orchestrates account selection and rate-limit rotation in front of the
/// execution coordinator.
pub struct FallbackRouter {
    coordinator: Arc<ExecutionCoordinator>,
    triggers: TriggerStore,
    accounts: AccountStore,
    executions: ExecutionStore,
    retries: RetryStore,
    builder: Arc<dyn CommandBuilder>,
    /// account_id → cooldown expiry. The only cross-execution shared state
    /// in the router; guarded by its own narrow critical section.
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
    config: RouterConfig,
}

impl FallbackRouter {
    pub fn new(
        coordinator: Arc<ExecutionCoordinator>,
        triggers: TriggerStore,
        accounts: AccountStore,
        executions: ExecutionStore,
        retries: RetryStore,
    ) -> Self {
        Self {
            coordinator,
            triggers,
            accounts,
            executions,
            retries,
            builder: Arc::new(AgentCommandBuilder),
            cooldowns: Mutex::new(HashMap::new()),
            config: RouterConfig::default(),
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn CommandBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Fire a configured trigger: render the prompt from the payload and run
    /// the fallback chain to a terminal execution.
    pub async fn execute_with_fallback(
        &self,
        trigger_id: &str,
        payload: serde_json::Value,
        source: &str,
    ) -> Result<Execution, EngineError> {
        let spec = self.load_trigger_spec(trigger_id).await?;
        let execution_key = format!("{}-{}", trigger_id, uuid::Uuid::new_v4());
        self.run_chain(spec, payload, source, 0, 1, execution_key)
            .await
    }

    /// Fire a configured trigger on behalf of a workflow node. The node_ref
    /// tag lets workflow-level cancellation reach the spawned process.
    pub async fn execute_trigger_as_node(
        &self,
        trigger_id: &str,
        payload: serde_json::Value,
        source: &str,
        node_ref: String,
    ) -> Result<Execution, EngineError> {
        let mut spec = self.load_trigger_spec(trigger_id).await?;
        spec.node_ref = Some(node_ref);
        let execution_key = format!("{}-{}", trigger_id, uuid::Uuid::new_v4());
        self.run_chain(spec, payload, source, 0, 1, execution_key)
            .await
    }

    async fn load_trigger_spec(&self, trigger_id: &str) -> Result<DispatchSpec, EngineError> {
        let trigger = self
            .triggers
            .get(trigger_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Trigger {} not found", trigger_id)))?;
        if !trigger.enabled {
            return Err(EngineError::BadRequest(format!(
                "Trigger {} is disabled",
                trigger_id
            )));
        }
        Ok(DispatchSpec::from_trigger(&trigger))
    }

    /// Dispatch an inline spec (workflow agent nodes).
    pub async fn execute_spec(
        &self,
        spec: DispatchSpec,
        payload: serde_json::Value,
        source: &str,
    ) -> Result<Execution, EngineError> {
        let execution_key = format!("{}-{}", spec.trigger_id, uuid::Uuid::new_v4());
        self.run_chain(spec, payload, source, 0, 1, execution_key)
            .await
    }

    /// Reload persisted retry state after a restart and reschedule each
    /// entry relative to its `next_retry_at`. Returns how many were
    /// rescheduled.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize, EngineError> {
        let pending = self.retries.load_pending().await?;
        let count = pending.len();
        for state in pending {
            let router = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = router.resume_one(state).await {
                    tracing::error!("[Router] Resumed retry failed: {}", e);
                }
            });
        }
        if count > 0 {
            tracing::info!("[Router] Rescheduled {} pending rate-limit retries", count);
        }
        Ok(count)
    }

    async fn resume_one(&self, state: RetryState) -> Result<(), EngineError> {
        let wait_ms = (state.next_retry_at - Utc::now()).num_milliseconds().max(0) as u64;
        if wait_ms > 0 {
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }

        // Claim-by-delete: whichever scheduler deletes the row runs the
        // retry; everyone else backs off. This keeps resume idempotent.
        if !self.retries.delete(&state.execution_key).await? {
            return Ok(());
        }

        let Some(trigger) = self.triggers.get(&state.trigger_id).await? else {
            tracing::warn!(
                "[Router] Dropping retry {}: trigger {} no longer exists",
                state.execution_key,
                state.trigger_id
            );
            return Ok(());
        };

        tracing::info!(
            "[Router] Resuming retry {} (attempt {}, account index {})",
            state.execution_key,
            state.attempt_count + 1,
            state.next_account_index
        );
        let spec = DispatchSpec::from_trigger(&trigger);
        self.run_chain(
            spec,
            state.payload,
            &state.source,
            state.next_account_index,
            state.attempt_count + 1,
            state.execution_key,
        )
        .await?;
        Ok(())
    }

    // ─── Chain execution ────────────────────────────────────────────────

    async fn run_chain(
        &self,
        spec: DispatchSpec,
        payload: serde_json::Value,
        source: &str,
        start_index: usize,
        mut attempt: u32,
        execution_key: String,
    ) -> Result<Execution, EngineError> {
        let prompt = render_prompt(&spec.prompt_template, &payload);
        let mut index = start_index;

        loop {
            // candidate_selected
            let Some((chain_index, account_id)) =
                self.select_candidate(&spec.fallback_chain, index)
            else {
                self.retries.delete(&execution_key).await?;
                return self
                    .record_rejected(&spec, reason::CHAIN_EXHAUSTED)
                    .await;
            };

            // budget_checked — fail fast before spawning anything
            if let Some(limit) = spec.budget_limit_microusd {
                let spent = self.executions.accumulated_cost(&spec.trigger_id).await?;
                if spent >= limit {
                    tracing::warn!(
                        "[Router] Budget pre-check rejected trigger {} ({} >= {} µUSD)",
                        spec.trigger_id,
                        spent,
                        limit
                    );
                    self.retries.delete(&execution_key).await?;
                    return self
                        .record_rejected(&spec, reason::BUDGET_EXCEEDED)
                        .await;
                }
            }

            let Some(account) = self.accounts.get(&account_id).await? else {
                tracing::warn!(
                    "[Router] Account {} in chain of trigger {} does not exist; skipping",
                    account_id,
                    spec.trigger_id
                );
                index = chain_index + 1;
                continue;
            };

            // dispatched
            let spent = self.executions.accumulated_cost(&spec.trigger_id).await?;
            let command = self.builder.build(&account, &prompt, &spec.working_dir);
            let running = self
                .coordinator
                .start(StartRequest {
                    trigger_id: Some(spec.trigger_id.clone()),
                    node_ref: spec.node_ref.clone(),
                    account_id: Some(account.id.clone()),
                    command,
                    budget_limit_microusd: spec.budget_limit_microusd,
                    budget_spent_microusd: spent,
                    grace_kill: spec.grace_kill,
                })
                .await?;
            tracing::info!(
                "[Router] Dispatched execution {} via account {} (attempt {}, source: {})",
                running.execution_id,
                account.name,
                attempt,
                source
            );
            let execution = running.wait().await?;

            match execution.status {
                ExecutionStatus::RateLimited => {
                    // rotate
                    let backoff = self.backoff_delay(attempt);
                    self.set_cooldown(&account.id, backoff);

                    let next_index = chain_index + 1;
                    if next_index >= spec.fallback_chain.len() {
                        // exhausted
                        self.retries.delete(&execution_key).await?;
                        return self
                            .record_rejected(&spec, reason::CHAIN_EXHAUSTED)
                            .await;
                    }

                    let state = RetryState {
                        execution_key: execution_key.clone(),
                        trigger_id: spec.trigger_id.clone(),
                        payload: payload.clone(),
                        source: source.to_string(),
                        next_account_index: next_index,
                        attempt_count: attempt,
                        backoff_seconds: backoff.as_secs(),
                        next_retry_at: Utc::now()
                            + chrono::Duration::from_std(backoff)
                                .unwrap_or_else(|_| chrono::Duration::seconds(0)),
                        created_at: Utc::now(),
                    };
                    self.retries.persist(&state).await?;

                    tracing::warn!(
                        "[Router] Account {} rate-limited; retrying with account index {} in {:?}",
                        account.name,
                        next_index,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    index = next_index;
                    attempt += 1;
                }
                _ => {
                    // succeeded (or terminally failed for a non-rotating reason)
                    self.retries.delete(&execution_key).await?;
                    return Ok(execution);
                }
            }
        }
    }

    /// First account at or after `start` that is not in cooldown.
    fn select_candidate(&self, chain: &[String], start: usize) -> Option<(usize, String)> {
        let now = Utc::now();
        let cooldowns = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        chain
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, id)| match cooldowns.get(*id) {
                Some(until) => *until <= now,
                None => true,
            })
            .map(|(i, id)| (i, id.clone()))
    }

    fn set_cooldown(&self, account_id: &str, duration: Duration) {
        let until = Utc::now()
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.cooldowns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account_id.to_string(), until);
    }

    /// Exponential backoff: base doubles per attempt, shift-capped, then
    /// clamped to the configured ceiling.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let secs = self
            .config
            .backoff_base_secs
            .saturating_mul(1u64 << shift)
            .min(self.config.backoff_cap_secs);
        Duration::from_secs(secs)
    }

    /// Record a fail-fast terminal execution with no process spawned.
    async fn record_rejected(
        &self,
        spec: &DispatchSpec,
        why: &'static str,
    ) -> Result<Execution, EngineError> {
        let mut execution = Execution::new(Some(spec.trigger_id.clone()), spec.node_ref.clone());
        execution.status = ExecutionStatus::Failed;
        execution.reason = Some(why.to_string());
        execution.finished_at = Some(Utc::now());
        self.executions.create(&execution).await?;
        self.executions
            .update_status(
                &execution.id,
                ExecutionStatus::Failed,
                StatusUpdate {
                    reason: Some(why.to_string()),
                    finished_at: execution.finished_at,
                    ..Default::default()
                },
            )
            .await?;
        tracing::warn!(
            "[Router] Trigger {} rejected without dispatch: {}",
            spec.trigger_id,
            why
        );
        Ok(execution)
    }
}

/// Substitute `${payload}` and `${payload.<key>}` references in a prompt
/// template from the fire payload.
pub fn render_prompt(template: &str, payload: &serde_json::Value) -> String {
    let payload_text = match payload {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut result = template.replace("${payload}", &payload_text);

    let key_re = Regex::new(r"\$\{payload\.([A-Za-z0-9_.-]+)\}").expect("payload pattern is valid");
    result = key_re
        .replace_all(&result, |caps: &regex::Captures| {
            let mut current = payload;
            for part in caps[1].split('.') {
                match current.get(part) {
                    Some(v) => current = v,
                    None => return caps[0].to_string(),
                }
            }
            match current {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        })
        .to_string();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::engine::logs::LogHub;
    use crate::engine::ratelimit::RegexRateLimitMatcher;
    use crate::engine::registry::ProcessRegistry;
    use crate::models::account::{BackendKind, CreateAccountInput};
    use crate::models::trigger::{CreateTriggerInput, TriggerKind};
    use crate::store::LogStore;

    /// Test builder: account names map to shell behaviors.
    ///   limited-* → prints a rate-limit signature on stderr, then sleeps
    ///   ok-*      → succeeds immediately
    struct StubCommandBuilder;

    impl CommandBuilder for StubCommandBuilder {
        fn build(&self, account: &BackendAccount, prompt: &str, working_dir: &str) -> CommandSpec {
            let script = if account.name.starts_with("limited") {
                "echo 'rate limit exceeded' 1>&2; sleep 30".to_string()
            } else {
                format!("echo 'agent ran: {}'", prompt.replace('\'', ""))
            };
            CommandSpec::for_shell(&script, working_dir)
        }
    }

    struct Harness {
        router: Arc<FallbackRouter>,
        triggers: TriggerStore,
        accounts: AccountStore,
        executions: ExecutionStore,
        retries: RetryStore,
    }

    async fn harness() -> Harness {
        let db = Database::open_in_memory().unwrap();
        let executions = ExecutionStore::new(db.clone());
        let retries = RetryStore::new(db.clone());
        let triggers = TriggerStore::new(db.clone());
        let accounts = AccountStore::new(db.clone());
        let hub = Arc::new(LogHub::new());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            ProcessRegistry::new(),
            hub,
            executions.clone(),
            LogStore::new(db),
            Arc::new(RegexRateLimitMatcher::new()),
        ));
        let router = Arc::new(
            FallbackRouter::new(
                coordinator,
                triggers.clone(),
                accounts.clone(),
                executions.clone(),
                retries.clone(),
            )
            .with_builder(Arc::new(StubCommandBuilder))
            .with_config(RouterConfig {
                backoff_base_secs: 0,
                backoff_cap_secs: 0,
            }),
        );
        Harness {
            router,
            triggers,
            accounts,
            executions,
            retries,
        }
    }

    async fn make_account(h: &Harness, name: &str) -> String {
        h.accounts
            .create(CreateAccountInput {
                name: name.to_string(),
                backend: BackendKind::ClaudeCode,
                api_key_env: None,
                model: None,
                base_url: None,
            })
            .await
            .unwrap()
            .id
    }

    async fn make_trigger(h: &Harness, chain: Vec<String>) -> String {
        h.triggers
            .create(CreateTriggerInput {
                name: "on-push".to_string(),
                kind: TriggerKind::Webhook,
                prompt_template: "Handle ${payload.event}".to_string(),
                working_dir: ".".to_string(),
                fallback_chain: chain,
                budget_limit_microusd: None,
                grace_kill_secs: 2,
                enabled: true,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn third_account_succeeds_after_two_rate_limits() {
        let h = harness().await;
        let chain = vec![
            make_account(&h, "limited-1").await,
            make_account(&h, "limited-2").await,
            make_account(&h, "ok-3").await,
        ];
        let ok_account = chain[2].clone();
        let trigger_id = make_trigger(&h, chain).await;

        let execution = h
            .router
            .execute_with_fallback(
                &trigger_id,
                serde_json::json!({"event": "push"}),
                "webhook",
            )
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.account_id.as_deref(), Some(ok_account.as_str()));
        // Success clears the persisted retry state.
        assert!(h.retries.load_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausting_the_chain_is_chain_exhausted_not_generic() {
        let h = harness().await;
        let chain = vec![
            make_account(&h, "limited-1").await,
            make_account(&h, "limited-2").await,
            make_account(&h, "limited-3").await,
        ];
        let trigger_id = make_trigger(&h, chain).await;

        let execution = h
            .router
            .execute_with_fallback(&trigger_id, serde_json::json!({"event": "push"}), "webhook")
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.reason.as_deref(), Some(reason::CHAIN_EXHAUSTED));
        assert!(h.retries.load_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn budget_precheck_rejects_before_spawn() {
        let h = harness().await;
        let chain = vec![make_account(&h, "ok-1").await];
        let trigger_id = make_trigger(&h, chain).await;
        h.triggers
            .update(
                &trigger_id,
                crate::models::trigger::UpdateTriggerInput {
                    budget_limit_microusd: Some(1_000_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Prior spend already over the limit
        let mut prior = Execution::new(Some(trigger_id.clone()), None);
        prior.status = ExecutionStatus::Completed;
        prior.cost_microusd = 2_000_000;
        h.executions.create(&prior).await.unwrap();

        let execution = h
            .router
            .execute_with_fallback(&trigger_id, serde_json::json!({}), "manual")
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.reason.as_deref(), Some(reason::BUDGET_EXCEEDED));
        // Fail fast: no process ran, so there is no started_at.
        assert!(execution.started_at.is_none());
    }

    #[tokio::test]
    async fn crash_recovery_triggers_exactly_one_retry() {
        let h = harness().await;
        let chain = vec![
            make_account(&h, "limited-1").await,
            make_account(&h, "ok-2").await,
        ];
        let trigger_id = make_trigger(&h, chain).await;

        // Simulate a crash mid-retry: a persisted RetryState pointing at the
        // second account, already due.
        let state = RetryState {
            execution_key: format!("{}-recovered", trigger_id),
            trigger_id: trigger_id.clone(),
            payload: serde_json::json!({"event": "push"}),
            source: "webhook".to_string(),
            next_account_index: 1,
            attempt_count: 1,
            backoff_seconds: 0,
            next_retry_at: Utc::now() - chrono::Duration::seconds(1),
            created_at: Utc::now(),
        };
        h.retries.persist(&state).await.unwrap();

        // Double restart: both resume passes may see the same entry; the
        // claim-by-delete ensures only one dispatches.
        assert_eq!(h.router.resume_pending().await.unwrap(), 1);
        let _ = h.router.resume_pending().await.unwrap();

        // Wait for the spawned resume tasks to drain.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if h.retries.load_pending().await.unwrap().is_empty()
                && !h.executions.list_recent(10).await.unwrap().is_empty()
            {
                let recent = h.executions.list_recent(10).await.unwrap();
                if recent.iter().any(|e| e.status.is_terminal()) {
                    break;
                }
            }
        }

        let recent = h.executions.list_recent(10).await.unwrap();
        let terminal: Vec<_> = recent.iter().filter(|e| e.status.is_terminal()).collect();
        assert_eq!(terminal.len(), 1, "exactly one retry attempt must run");
        assert_eq!(terminal[0].status, ExecutionStatus::Completed);
    }

    #[test]
    fn render_prompt_substitutes_payload_paths() {
        let payload = serde_json::json!({
            "event": "issues.opened",
            "issue": { "title": "crash on save" }
        });
        assert_eq!(
            render_prompt("Fix ${payload.issue.title} (${payload.event})", &payload),
            "Fix crash on save (issues.opened)"
        );
        assert_eq!(
            render_prompt("Raw: ${payload}", &serde_json::json!("plain text")),
            "Raw: plain text"
        );
        // Unknown keys are left intact
        assert_eq!(
            render_prompt("${payload.missing}", &payload),
            "${payload.missing}"
        );
    }
}
