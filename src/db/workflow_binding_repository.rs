use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::workflow_binding::WorkflowBinding;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowBindingRepository: Send + Sync {
    async fn find_binding(&self, workflow_id: &str)
        -> Result<Option<WorkflowBinding>, sqlx::Error>;

    async fn list_bindings(&self) -> Result<Vec<WorkflowBinding>, sqlx::Error>;

    async fn find_binding_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Option<WorkflowBinding>, sqlx::Error>;

    async fn set_local_active(&self, workflow_id: &str, is_active: bool)
        -> Result<bool, sqlx::Error>;

    async fn mark_reconciled(
        &self,
        workflow_id: &str,
        reconciled_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error>;
}
