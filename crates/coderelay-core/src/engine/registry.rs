//! Process registry — live subprocess handles keyed by execution id.
//!
//! The registry owns every `ProcessHandle` and exposes cooperative
//! cancellation. It is one of the two cross-execution shared structures in
//! the engine (the other is the log hub); both use a single narrow mutex and
//! never hold it across a suspension point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::EngineError;
use crate::store::ExecutionStore;

/// Process-group lifecycle handle: wraps the OS pid/pgid and the
/// cancellation flag for one supervised subprocess.
///
/// Graceful/forceful signalling targets the whole process group so agent
/// CLIs cannot leave grandchildren behind.
pub struct ProcessHandle {
    pub pid: u32,
    pub pgid: i32,
    /// `<workflow_execution_id>:<node_id>` when owned by a workflow node;
    /// lets workflow-level cancellation reach in-flight node executions.
    pub node_ref: Option<String>,
    cancel_requested: AtomicBool,
    terminate_requested: AtomicBool,
    terminate: Notify,
}

impl ProcessHandle {
    pub fn new(pid: u32, node_ref: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            // Spawned with process_group(0): the child leads its own group.
            pgid: pid as i32,
            node_ref,
            cancel_requested: AtomicBool::new(false),
            terminate_requested: AtomicBool::new(false),
            terminate: Notify::new(),
        })
    }

    /// Operator/user cancellation: flags the execution `cancelled` and asks
    /// the coordinator to begin the terminate → grace → kill sequence.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.request_terminate();
    }

    /// Internal termination (rate-limit hit, budget breach). Does not set
    /// the cancel flag; the caller records its own terminal reason.
    pub fn request_terminate(&self) {
        self.terminate_requested.store(true, Ordering::SeqCst);
        self.terminate.notify_one();
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate_requested.load(Ordering::SeqCst)
    }

    /// Resolve once termination has been requested.
    pub async fn terminate_wait(&self) {
        loop {
            if self.terminate_requested.load(Ordering::SeqCst) {
                return;
            }
            self.terminate.notified().await;
        }
    }

    /// Send the graceful signal (SIGTERM) to the process group.
    /// Returns false when group signalling is unavailable on this platform.
    pub fn signal_graceful(&self) -> bool {
        self.signal(false)
    }

    /// Send the forceful signal (SIGKILL) to the process group.
    pub fn signal_forceful(&self) -> bool {
        self.signal(true)
    }

    #[cfg(unix)]
    fn signal(&self, forceful: bool) -> bool {
        let sig = if forceful { libc::SIGKILL } else { libc::SIGTERM };
        // Negative pid addresses the whole group.
        let rc = unsafe { libc::kill(-self.pgid, sig) };
        rc == 0
    }

    #[cfg(not(unix))]
    fn signal(&self, _forceful: bool) -> bool {
        false
    }
}

/// Tracks live subprocess handles by execution id.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<ProcessHandle>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. At most one entry may exist per execution id.
    pub fn register(
        &self,
        execution_id: &str,
        handle: Arc<ProcessHandle>,
    ) -> Result<(), EngineError> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(execution_id) {
            return Err(EngineError::Conflict(format!(
                "Execution {} already has a registered process",
                execution_id
            )));
        }
        map.insert(execution_id.to_string(), handle);
        Ok(())
    }

    pub fn get(&self, execution_id: &str) -> Option<Arc<ProcessHandle>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(execution_id)
            .cloned()
    }

    /// Remove the handle when its process has exited or been killed.
    pub fn remove(&self, execution_id: &str) -> Option<Arc<ProcessHandle>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(execution_id)
    }

    /// Request cooperative cancellation of a running execution.
    /// Returns false when no live process is registered under the id.
    pub fn cancel(&self, execution_id: &str) -> bool {
        match self.get(execution_id) {
            Some(handle) => {
                tracing::info!(
                    "[Registry] Cancellation requested for execution {} (pid {})",
                    execution_id,
                    handle.pid
                );
                handle.request_cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every live execution whose node_ref starts with the given
    /// prefix (workflow-level cancellation). Returns how many were hit.
    pub fn cancel_by_node_prefix(&self, prefix: &str) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut hit = 0;
        for handle in map.values() {
            if handle
                .node_ref
                .as_ref()
                .map(|r| r.starts_with(prefix))
                .unwrap_or(false)
            {
                handle.request_cancel();
                hit += 1;
            }
        }
        hit
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Startup reconciliation: execution records left `pending`/`running` by
    /// a previous process have no live subprocess anymore, so they are
    /// transitioned to `failed` with the documented restart reason. This is
    /// the only recovery path for orphaned state; there is no attempt to
    /// re-attach to surviving OS processes.
    pub async fn cleanup_dead(&self, store: &ExecutionStore) -> Result<Vec<String>, EngineError> {
        let reconciled = store.fail_incomplete_on_startup().await?;
        if !reconciled.is_empty() {
            tracing::warn!(
                "[Registry] Reconciled {} execution(s) interrupted by restart",
                reconciled.len()
            );
        }
        Ok(reconciled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_enforces_single_entry_per_execution() {
        let registry = ProcessRegistry::new();
        let handle = ProcessHandle::new(4242, None);

        registry.register("exec-1", handle.clone()).unwrap();
        assert!(registry.register("exec-1", handle).is_err());
        assert_eq!(registry.live_count(), 1);

        registry.remove("exec-1");
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn cancel_sets_flags_and_reports_missing() {
        let registry = ProcessRegistry::new();
        let handle = ProcessHandle::new(4242, None);
        registry.register("exec-1", handle.clone()).unwrap();

        assert!(registry.cancel("exec-1"));
        assert!(handle.cancel_requested());
        assert!(handle.terminate_requested());

        assert!(!registry.cancel("exec-unknown"));
    }

    #[tokio::test]
    async fn terminate_wait_resolves_after_request() {
        let handle = ProcessHandle::new(4242, None);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.terminate_wait().await })
        };
        handle.request_terminate();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("terminate_wait should resolve")
            .unwrap();
    }
}
