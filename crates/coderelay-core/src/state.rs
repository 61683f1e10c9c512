//! Shared application state wiring the stores and engine together.

use std::sync::Arc;

use crate::db::Database;
use crate::engine::logs::LogHub;
use crate::engine::ratelimit::RegexRateLimitMatcher;
use crate::engine::registry::ProcessRegistry;
use crate::engine::{ExecutionCoordinator, FallbackRouter};
use crate::store::{
    AccountStore, ExecutionStore, LogStore, RetryStore, TriggerStore, WorkflowStore,
};
use crate::workflow::WorkflowRunner;

/// Shared state accessible by all API handlers and the CLI.
pub struct AppStateInner {
    pub db: Database,
    pub account_store: AccountStore,
    pub trigger_store: TriggerStore,
    pub execution_store: ExecutionStore,
    pub log_store: LogStore,
    pub retry_store: RetryStore,
    pub workflow_store: WorkflowStore,
    pub registry: ProcessRegistry,
    pub hub: Arc<LogHub>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub router: Arc<FallbackRouter>,
    pub workflow_runner: Arc<WorkflowRunner>,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(db: Database) -> Self {
        let account_store = AccountStore::new(db.clone());
        let trigger_store = TriggerStore::new(db.clone());
        let execution_store = ExecutionStore::new(db.clone());
        let log_store = LogStore::new(db.clone());
        let retry_store = RetryStore::new(db.clone());
        let workflow_store = WorkflowStore::new(db.clone());

        let registry = ProcessRegistry::new();
        let hub = Arc::new(LogHub::new());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            registry.clone(),
            hub.clone(),
            execution_store.clone(),
            log_store.clone(),
            Arc::new(RegexRateLimitMatcher::new()),
        ));
        let router = Arc::new(FallbackRouter::new(
            coordinator.clone(),
            trigger_store.clone(),
            account_store.clone(),
            execution_store.clone(),
            retry_store.clone(),
        ));
        let workflow_runner = Arc::new(WorkflowRunner::new(
            workflow_store.clone(),
            router.clone(),
            log_store.clone(),
            registry.clone(),
        ));

        Self {
            db,
            account_store,
            trigger_store,
            execution_store,
            log_store,
            retry_store,
            workflow_store,
            registry,
            hub,
            coordinator,
            router,
            workflow_runner,
        }
    }

    /// Crash recovery, run once at startup before any new execution:
    /// reconcile orphaned execution records, then reschedule persisted
    /// rate-limit retries.
    pub async fn recover(&self) -> Result<(), crate::error::EngineError> {
        let reconciled = self.registry.cleanup_dead(&self.execution_store).await?;
        for id in &reconciled {
            // Late log subscribers still get a final `complete` event.
            self.hub.start_execution(id);
            self.hub.finish_execution(
                id,
                crate::models::execution::ExecutionStatus::Failed,
                Some(crate::models::execution::reason::INTERRUPTED_BY_RESTART.to_string()),
            );
        }
        self.router.resume_pending().await?;
        Ok(())
    }
}
