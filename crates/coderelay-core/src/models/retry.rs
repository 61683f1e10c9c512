use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable record of an in-flight rate-limit retry.
///
/// Created on first rate-limit detection, deleted on success or attempt
/// exhaustion. Survives process restart: pending entries are reloaded at
/// startup and rescheduled relative to `next_retry_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryState {
    /// Stable key for the retried unit of work (trigger or workflow node).
    pub execution_key: String,
    pub trigger_id: String,
    pub payload: serde_json::Value,
    pub source: String,
    /// Index into the trigger's fallback chain to try next.
    pub next_account_index: usize,
    pub attempt_count: u32,
    pub backoff_seconds: u64,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
