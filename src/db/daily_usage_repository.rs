use async_trait::async_trait;
use chrono::NaiveDate;

use crate::models::usage::DailyUsageRecord;

/// Read-only view over the durable per-day usage counters.
#[async_trait]
pub trait DailyUsageRepository: Send + Sync {
    async fn list_range(
        &self,
        workflow_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyUsageRecord>, sqlx::Error>;
}
