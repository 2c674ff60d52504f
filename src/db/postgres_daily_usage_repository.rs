use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;

use crate::{db::daily_usage_repository::DailyUsageRepository, models::usage::DailyUsageRecord};

pub struct PostgresDailyUsageRepository {
    pub pool: PgPool,
}

#[async_trait]
impl DailyUsageRepository for PostgresDailyUsageRepository {
    async fn list_range(
        &self,
        workflow_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyUsageRecord>, sqlx::Error> {
        let results = sqlx::query_as::<_, DailyUsageRecord>(
            r#"
            SELECT workflow_id, date, tokens_used, requests_count
            FROM agent_daily_usage
            WHERE workflow_id = $1 AND date BETWEEN $2 AND $3
            ORDER BY date ASC
            "#,
        )
        .bind(workflow_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(results)
    }
}
