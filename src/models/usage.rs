use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::workflow::ExecutionStatus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeUsage {
    pub node_name: String,
    pub node_type: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model: Option<String>,
}

/// Token usage reconstructed from one execution's result payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub node_breakdown: Vec<NodeUsage>,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.node_breakdown.is_empty()
    }
}

/// One row of the recent-execution listing. `usage` is `None` when the
/// execution detail could not be fetched; `error` then says why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionUsage {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

impl ExecutionUsage {
    pub fn usage_unknown(&self) -> bool {
        self.usage.is_none()
    }
}

/// Token accounting over the most recent terminal executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveUsage {
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub execution_count: usize,
    pub terminal_executions_in_window: usize,
    pub failed_executions: usize,
    pub partial: bool,
    pub error: Option<String>,
    pub by_execution: Vec<ExecutionUsage>,
}

impl LiveUsage {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            partial: true,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Durable per-day counter written by the usage event recorder.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsageRecord {
    pub workflow_id: String,
    pub date: NaiveDate,
    pub tokens_used: i64,
    pub requests_count: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageBucket {
    pub tokens: i64,
    pub requests: i64,
}

impl UsageBucket {
    pub fn add(&mut self, record: &DailyUsageRecord) {
        self.tokens = self.tokens.saturating_add(record.tokens_used);
        self.requests = self.requests.saturating_add(record.requests_count);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub tokens: i64,
    pub requests: i64,
}

/// Calendar rollups computed from the durable daily counters only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CalendarUsage {
    pub today: UsageBucket,
    pub week: UsageBucket,
    pub month: UsageBucket,
    pub daily_data: Vec<DailyPoint>,
}

/// The live and durable figures are reported side by side and are not
/// expected to reconcile with each other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub workflow_id: String,
    pub live: LiveUsage,
    pub calendar: CalendarUsage,
    pub generated_at: DateTime<Utc>,
}
