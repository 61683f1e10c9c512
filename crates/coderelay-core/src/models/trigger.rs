use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What fires a trigger. The engine only consumes the definition; delivery
/// (webhook endpoints, cron ticks, GitHub event intake) lives outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Webhook,
    Schedule,
    Github,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
            Self::Github => "github",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook" => Some(Self::Webhook),
            "schedule" => Some(Self::Schedule),
            "github" => Some(Self::Github),
            _ => None,
        }
    }
}

/// A configured rule that, when fired, produces one Execution.
///
/// `fallback_chain` is the ordered list of account ids tried in sequence
/// when a provider rate-limits. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDef {
    pub id: String,
    pub name: String,
    pub kind: TriggerKind,
    /// Prompt template; `${payload}` and `${payload.<key>}` are substituted
    /// from the fire payload.
    pub prompt_template: String,
    pub working_dir: String,
    pub fallback_chain: Vec<String>,
    /// Hard spend ceiling in micro-USD; `None` means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_limit_microusd: Option<i64>,
    /// Seconds between graceful terminate and forceful kill.
    pub grace_kill_secs: u64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a new trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTriggerInput {
    pub name: String,
    pub kind: TriggerKind,
    pub prompt_template: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    pub budget_limit_microusd: Option<i64>,
    #[serde(default = "default_grace_kill")]
    pub grace_kill_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_working_dir() -> String {
    ".".to_string()
}

fn default_grace_kill() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// Partial update input for PATCH.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTriggerInput {
    pub name: Option<String>,
    pub kind: Option<TriggerKind>,
    pub prompt_template: Option<String>,
    pub working_dir: Option<String>,
    pub fallback_chain: Option<Vec<String>>,
    pub budget_limit_microusd: Option<i64>,
    pub grace_kill_secs: Option<u64>,
    pub enabled: Option<bool>,
}
