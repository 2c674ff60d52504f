use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Remote identity of an automation workflow as last reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDescriptor {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowDescriptor {
    pub fn from_engine(value: &Value) -> Option<Self> {
        let id = value_as_id(value.get("id")?)?;
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let active = value
            .get("active")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Some(Self {
            id,
            name,
            active,
            created_at: parse_timestamp(value.get("createdAt")),
            updated_at: parse_timestamp(value.get("updatedAt")),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Running,
    Unknown,
}

impl ExecutionStatus {
    /// Maps the engine's status vocabulary onto the four states we track.
    /// Older engine versions omit `status` and only report `finished`.
    pub fn from_engine(status: Option<&str>, finished: Option<bool>, stopped: bool) -> Self {
        match status.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("success") => ExecutionStatus::Success,
            Some("error") | Some("crashed") | Some("failed") | Some("canceled") => {
                ExecutionStatus::Error
            }
            Some("running") | Some("waiting") | Some("new") => ExecutionStatus::Running,
            Some(_) => ExecutionStatus::Unknown,
            None => match finished {
                Some(true) => ExecutionStatus::Success,
                Some(false) if stopped => ExecutionStatus::Error,
                Some(false) => ExecutionStatus::Running,
                None => ExecutionStatus::Unknown,
            },
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ExecutionSummary {
    /// Returns `None` when the record lacks an id or a parseable start time.
    pub fn from_engine(value: &Value) -> Option<Self> {
        let execution_id = value_as_id(value.get("id")?)?;
        let workflow_id = value
            .get("workflowId")
            .and_then(value_as_id)
            .unwrap_or_default();
        let started_at = parse_timestamp(value.get("startedAt"))?;
        let stopped_at = parse_timestamp(value.get("stoppedAt"));
        let status = ExecutionStatus::from_engine(
            value.get("status").and_then(Value::as_str),
            value.get("finished").and_then(Value::as_bool),
            stopped_at.is_some(),
        );
        Some(Self {
            execution_id,
            workflow_id,
            status,
            started_at,
            stopped_at,
        })
    }
}

// The engine has used both numeric and string ids across versions.
fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
