use async_trait::async_trait;
use uuid::Uuid;

use crate::models::agent_config::AgentConfigRecord;

#[async_trait]
pub trait AgentConfigRepository: Send + Sync {
    async fn find_by_product(
        &self,
        product_id: Uuid,
    ) -> Result<Option<AgentConfigRecord>, sqlx::Error>;

    /// Last write wins at the row level.
    async fn upsert(&self, record: &AgentConfigRecord) -> Result<AgentConfigRecord, sqlx::Error>;
}
