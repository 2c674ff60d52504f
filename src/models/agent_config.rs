use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow};
use uuid::Uuid;

use crate::utils::credentials::CredentialMap;

pub const DEFAULT_SESSION_KEY_TEMPLATE: &str = "{{ $json.sessionId }}";
pub const DEFAULT_CONTEXT_WINDOW: u32 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Do,
    Dont,
}

impl RuleKind {
    pub fn marker(self) -> char {
        match self {
            RuleKind::Do => '✓',
            RuleKind::Dont => '✗',
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BehaviorRule {
    pub instruction: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPolicy {
    #[serde(default = "default_session_key_template")]
    pub session_key_template: String,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            session_key_template: default_session_key_template(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            retention_days: None,
        }
    }
}

fn default_session_key_template() -> String {
    DEFAULT_SESSION_KEY_TEMPLATE.to_string()
}

fn default_context_window() -> u32 {
    DEFAULT_CONTEXT_WINDOW
}

/// Locally owned agent settings for one customer product. The remote
/// workflow only ever holds a projection of this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfiguration {
    /// Taken from the route path when a request body leaves it out.
    #[serde(default)]
    pub product_id: Uuid,
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub behavior_rules: Vec<BehaviorRule>,
    #[serde(default)]
    pub memory: MemoryPolicy,
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(default)]
    pub credentials: CredentialMap,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AgentConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.provider.trim().is_empty() {
            return Err("provider is required".into());
        }
        if self.model.trim().is_empty() {
            return Err("model is required".into());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err("temperature must be between 0 and 2".into());
        }
        if self.max_tokens == 0 {
            return Err("max tokens must be greater than zero".into());
        }
        if self.memory.context_window == 0 {
            return Err("memory context window must be greater than zero".into());
        }
        Ok(())
    }
}

/// What the remote workflow receives. Rebuilt in full from the local
/// configuration on every sync.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentProjection {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub session_key: String,
    pub context_window: u32,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

impl fmt::Debug for AgentProjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentProjection")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("session_key", &self.session_key)
            .field("context_window", &self.context_window)
            .field("tools", &self.tools)
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Row shape of `agent_configurations`. `credentials` holds the opaque blob,
/// sealed when an encryption key is configured.
#[derive(Debug, Clone, FromRow)]
pub struct AgentConfigRecord {
    pub product_id: Uuid,
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: i32,
    pub system_prompt: String,
    pub behavior_rules: Json<Vec<BehaviorRule>>,
    pub session_key_template: String,
    pub context_window: i32,
    pub retention_days: Option<i32>,
    pub enabled_tools: Json<Vec<String>>,
    pub credentials: String,
    pub updated_at: DateTime<Utc>,
}
