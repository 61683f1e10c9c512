use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::execution::ExecutionStatus;

/// One run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Pending,
            error: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Per-node record within a workflow run. A node is eligible to run only
/// when all of its upstream NodeExecutions are `completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub id: String,
    pub workflow_execution_id: String,
    pub node_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_message: Option<WorkflowMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_message: Option<WorkflowMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NodeExecution {
    pub fn new(workflow_execution_id: &str, node_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_execution_id: workflow_execution_id.to_string(),
            node_id: node_id.to_string(),
            status: ExecutionStatus::Pending,
            input_message: None,
            output_message: None,
            error: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Immutable envelope passed along workflow edges: the current payload plus
/// variables accumulated by upstream nodes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMessage {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub variables: std::collections::HashMap<String, String>,
}

impl WorkflowMessage {
    pub fn from_payload(payload: serde_json::Value) -> Self {
        Self {
            payload,
            variables: std::collections::HashMap::new(),
        }
    }

    /// Return a new envelope with one variable added.
    pub fn with_variable(&self, key: &str, value: String) -> Self {
        let mut next = self.clone();
        next.variables.insert(key.to_string(), value);
        next
    }
}
