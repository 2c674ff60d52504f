use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    db::workflow_binding_repository::WorkflowBindingRepository,
    models::workflow_binding::WorkflowBinding,
};

pub struct PostgresWorkflowBindingRepository {
    pub pool: PgPool,
}

#[async_trait]
impl WorkflowBindingRepository for PostgresWorkflowBindingRepository {
    async fn find_binding(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowBinding>, sqlx::Error> {
        let result = sqlx::query_as::<_, WorkflowBinding>(
            r#"
            SELECT workflow_id, product_id, is_active, webhook_url, last_reconciled_at
            FROM agent_workflows
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    async fn list_bindings(&self) -> Result<Vec<WorkflowBinding>, sqlx::Error> {
        let rows = sqlx::query_as::<_, WorkflowBinding>(
            r#"
            SELECT workflow_id, product_id, is_active, webhook_url, last_reconciled_at
            FROM agent_workflows
            ORDER BY workflow_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_binding_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Option<WorkflowBinding>, sqlx::Error> {
        let result = sqlx::query_as::<_, WorkflowBinding>(
            r#"
            SELECT workflow_id, product_id, is_active, webhook_url, last_reconciled_at
            FROM agent_workflows
            WHERE product_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    async fn set_local_active(
        &self,
        workflow_id: &str,
        is_active: bool,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE agent_workflows
            SET is_active = $2,
                updated_at = now()
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(is_active)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_reconciled(
        &self,
        workflow_id: &str,
        reconciled_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE agent_workflows
            SET last_reconciled_at = $2
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(reconciled_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
