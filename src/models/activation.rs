use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivationStatus {
    Unknown,
    Online,
    Offline,
    Transitioning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivationState {
    pub workflow_id: String,
    pub local_is_active: bool,
    pub remote_is_active: Option<bool>,
    pub status: ActivationStatus,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

impl ActivationState {
    pub fn unknown(workflow_id: &str, local_is_active: bool) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            local_is_active,
            remote_is_active: None,
            status: ActivationStatus::Unknown,
            last_reconciled_at: None,
        }
    }

    /// Local and remote disagree. Only meaningful once the remote side has
    /// been read at least once.
    pub fn drift(&self) -> bool {
        matches!(self.remote_is_active, Some(remote) if remote != self.local_is_active)
    }
}
