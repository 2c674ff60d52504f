use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Links a customer product to the remote workflow backing its agent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct WorkflowBinding {
    pub workflow_id: String,
    pub product_id: Uuid,
    pub is_active: bool,
    pub webhook_url: Option<String>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}
