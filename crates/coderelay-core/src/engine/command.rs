//! Command-line construction for external coding-agent CLIs.
//!
//! Each backend kind maps to its CLI's non-interactive invocation:
//!   - claude-code: `claude -p <prompt> --output-format stream-json --verbose`
//!   - codex:       `codex exec <prompt> --json`
//!   - opencode:    `opencode run <prompt> --print-logs`
//!
//! The API key is passed via the environment variable the account names;
//! it never appears on the command line.

use std::collections::HashMap;

use serde::Deserialize;

use crate::models::account::{BackendAccount, BackendKind};

/// A fully-resolved command ready to spawn.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: String,
}

impl CommandSpec {
    /// Build the invocation for one agent run.
    pub fn for_agent(account: &BackendAccount, prompt: &str, working_dir: &str) -> Self {
        let mut env = HashMap::new();

        if let Some(ref key_env) = account.api_key_env {
            if let Ok(key) = std::env::var(key_env) {
                let target = match account.backend {
                    BackendKind::ClaudeCode => "ANTHROPIC_API_KEY",
                    BackendKind::Codex => "OPENAI_API_KEY",
                    BackendKind::Opencode => "OPENCODE_API_KEY",
                };
                env.insert(target.to_string(), key);
            }
        }
        if let Some(ref base_url) = account.base_url {
            let target = match account.backend {
                BackendKind::ClaudeCode => "ANTHROPIC_BASE_URL",
                BackendKind::Codex => "OPENAI_BASE_URL",
                BackendKind::Opencode => "OPENCODE_BASE_URL",
            };
            env.insert(target.to_string(), base_url.clone());
        }

        let (program, args) = match account.backend {
            BackendKind::ClaudeCode => {
                let mut args = vec![
                    "-p".to_string(),
                    prompt.to_string(),
                    "--output-format".to_string(),
                    "stream-json".to_string(),
                    "--verbose".to_string(),
                ];
                if let Some(ref model) = account.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                ("claude".to_string(), args)
            }
            BackendKind::Codex => {
                let mut args = vec!["exec".to_string(), prompt.to_string(), "--json".to_string()];
                if let Some(ref model) = account.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                ("codex".to_string(), args)
            }
            BackendKind::Opencode => {
                let mut args = vec![
                    "run".to_string(),
                    prompt.to_string(),
                    "--print-logs".to_string(),
                ];
                if let Some(ref model) = account.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                ("opencode".to_string(), args)
            }
        };

        Self {
            program,
            args,
            env,
            working_dir: working_dir.to_string(),
        }
    }

    /// Build a plain shell invocation (skill / command / script workflow nodes).
    pub fn for_shell(command_line: &str, working_dir: &str) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command_line.to_string()],
            env: HashMap::new(),
            working_dir: working_dir.to_string(),
        }
    }
}

// ─── Cost extraction ─────────────────────────────────────────────────────

/// The subset of a stream-json `result` line we care about.
#[derive(Debug, Deserialize)]
struct ResultLine {
    #[serde(rename = "type", default)]
    line_type: String,
    total_cost_usd: Option<f64>,
    cost_usd: Option<f64>,
}

/// Parse the running cost out of an agent stdout line, in micro-USD.
///
/// Claude Code's stream-json `result` message carries `total_cost_usd`;
/// some builds emit `cost_usd`. Non-JSON lines and lines without a cost
/// field return `None`.
pub fn extract_cost_microusd(line: &str) -> Option<i64> {
    let parsed: ResultLine = serde_json::from_str(line.trim()).ok()?;
    if parsed.line_type != "result" {
        return None;
    }
    let usd = parsed.total_cost_usd.or(parsed.cost_usd)?;
    Some((usd * 1_000_000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn account(backend: BackendKind) -> BackendAccount {
        BackendAccount {
            id: "acc-1".to_string(),
            name: "primary".to_string(),
            backend,
            api_key_env: None,
            model: Some("test-model".to_string()),
            base_url: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn claude_command_uses_stream_json() {
        let spec = CommandSpec::for_agent(&account(BackendKind::ClaudeCode), "fix the bug", "/repo");
        assert_eq!(spec.program, "claude");
        assert_eq!(spec.args[0], "-p");
        assert_eq!(spec.args[1], "fix the bug");
        assert!(spec.args.contains(&"stream-json".to_string()));
        assert!(spec.args.contains(&"--model".to_string()));
        assert_eq!(spec.working_dir, "/repo");
    }

    #[test]
    fn codex_command_uses_exec() {
        let spec = CommandSpec::for_agent(&account(BackendKind::Codex), "add tests", ".");
        assert_eq!(spec.program, "codex");
        assert_eq!(spec.args[0], "exec");
    }

    #[test]
    fn cost_extracted_from_result_line() {
        let line = r#"{"type":"result","subtype":"success","total_cost_usd":0.0421}"#;
        assert_eq!(extract_cost_microusd(line), Some(42_100));
    }

    #[test]
    fn cost_ignores_non_result_lines() {
        assert_eq!(extract_cost_microusd("plain text output"), None);
        assert_eq!(
            extract_cost_microusd(r#"{"type":"assistant","message":{}}"#),
            None
        );
    }
}
