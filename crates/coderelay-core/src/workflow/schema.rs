//! YAML schema types for workflow definitions.
//!
//! A workflow YAML defines a node/edge graph of agent invocations and
//! supporting steps:
//!
//! ```yaml
//! name: "Issue triage"
//! failFast: false
//!
//! nodes:
//!   - id: classify
//!     kind: agent
//!     prompt: "Classify this issue: ${payload}"
//!     fallbackChain: [primary, backup]
//!   - id: is-bug
//!     kind: conditional
//!     when: "${variables.category} == bug"
//!   - id: fix
//!     kind: trigger
//!     triggerId: autofix-trigger
//!   - id: notify
//!     kind: command
//!     run: "scripts/notify.sh"
//!
//! edges:
//!   - { from: classify, to: is-bug }
//!   - { from: is-bug, to: fix, branch: true }
//!   - { from: is-bug, to: notify, branch: false }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Top-level workflow definition loaded from a YAML file or API body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDef {
    /// Workflow name
    pub name: String,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// When true, the first node failure halts the whole run instead of
    /// only that node's branch.
    #[serde(default)]
    pub fail_fast: bool,

    /// Graph nodes
    pub nodes: Vec<NodeDef>,

    /// Directed edges between nodes
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

/// What a node does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Fire a configured trigger through the fallback router.
    Trigger,
    /// Run an inline agent prompt through the fallback router.
    Agent,
    /// Run an installed skill executable (bounded subprocess).
    Skill,
    /// Run a shell command (bounded subprocess).
    Command,
    /// Run an inline script body (bounded subprocess).
    Script,
    /// Evaluate a predicate and select one outgoing branch.
    Conditional,
    /// Pure data mapping into the message variables; no subprocess.
    Transform,
}

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDef {
    /// Node id (unique within the workflow, used in edges and templates)
    pub id: String,

    pub kind: NodeKind,

    /// For `trigger` nodes: the configured trigger to fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,

    /// For `agent` nodes: prompt template. Supports `${payload}`,
    /// `${variables.<key>}` and `${nodes.<id>.output}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// For `agent` nodes: ordered account ids tried on rate-limit.
    #[serde(default)]
    pub fallback_chain: Vec<String>,

    /// For `skill`/`command` nodes: the command line. For `script` nodes:
    /// the inline script body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,

    /// Timeout for bounded-subprocess kinds (seconds).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// For `conditional` nodes: predicate template. After substitution, an
    /// empty string or the literal "false" selects the false branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// For `transform` nodes: variable name → value template.
    #[serde(default)]
    pub set: HashMap<String, String>,
}

fn default_timeout() -> u64 {
    300
}

/// A directed edge. `branch` labels the true/false outputs of a
/// conditional node; plain edges leave it unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<bool>,
}

impl WorkflowDef {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::BadRequest(format!("Failed to parse workflow YAML: {}", e)))
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::BadRequest(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn get_node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_workflow() {
        let yaml = r#"
name: "Smoke"
nodes:
  - id: hello
    kind: command
    run: "echo hello"
"#;
        let wf = WorkflowDef::from_yaml(yaml).unwrap();
        assert_eq!(wf.name, "Smoke");
        assert_eq!(wf.nodes.len(), 1);
        assert_eq!(wf.nodes[0].kind, NodeKind::Command);
        assert_eq!(wf.nodes[0].timeout_secs, 300);
        assert!(!wf.fail_fast);
    }

    #[test]
    fn parse_full_workflow() {
        let yaml = r#"
name: "Issue triage"
description: "Classify, then fix or notify"
failFast: true
nodes:
  - id: classify
    kind: agent
    prompt: "Classify: ${payload}"
    fallbackChain: [primary, backup]
  - id: is-bug
    kind: conditional
    when: "${variables.category} == bug"
  - id: fix
    kind: trigger
    triggerId: autofix
  - id: notify
    kind: command
    run: "scripts/notify.sh"
    timeoutSecs: 30
  - id: tag
    kind: transform
    set:
      label: "triaged-${variables.category}"
edges:
  - { from: classify, to: is-bug }
  - { from: is-bug, to: fix, branch: true }
  - { from: is-bug, to: notify, branch: false }
  - { from: fix, to: tag }
"#;
        let wf = WorkflowDef::from_yaml(yaml).unwrap();
        assert!(wf.fail_fast);
        assert_eq!(wf.nodes.len(), 5);
        assert_eq!(wf.edges.len(), 4);
        assert_eq!(
            wf.get_node("classify").unwrap().fallback_chain,
            vec!["primary", "backup"]
        );
        assert_eq!(wf.get_node("notify").unwrap().timeout_secs, 30);
        assert_eq!(wf.edges[1].branch, Some(true));
        assert_eq!(
            wf.get_node("tag").unwrap().set.get("label").unwrap(),
            "triaged-${variables.category}"
        );
    }
}
