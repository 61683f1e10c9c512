use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of one external-process invocation.
///
/// Valid paths: `pending → running → {completed|failed|cancelled|rate_limited}`.
/// Terminal states are never re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    RateLimited,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RateLimited => "rate_limited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "rate_limited" => Some(Self::RateLimited),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Machine-readable reason strings attached to terminal statuses.
pub mod reason {
    pub const SPAWN_FAILURE: &str = "spawn_failure";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const BUDGET_EXCEEDED: &str = "budget_exceeded";
    pub const CANCELLED: &str = "cancelled";
    pub const CHAIN_EXHAUSTED: &str = "chain_exhausted";
    pub const INTERRUPTED_BY_RESTART: &str = "interrupted_by_restart";
    pub const NONZERO_EXIT: &str = "nonzero_exit";
}

/// One external-process invocation, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    /// `<workflow_execution_id>:<node_id>` when spawned by the DAG executor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<String>,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub cost_microusd: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(trigger_id: Option<String>, node_ref: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trigger_id,
            node_ref,
            status: ExecutionStatus::Pending,
            reason: None,
            account_id: None,
            exit_code: None,
            cost_microusd: 0,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Which pipe a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A single captured output line. Sequence numbers are monotonic per
/// execution and drive replay-on-reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub execution_id: String,
    pub stream: LogStream,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub text: String,
}
