use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{db::agent_config_repository::AgentConfigRepository, models::agent_config::AgentConfigRecord};

pub struct PostgresAgentConfigRepository {
    pub pool: PgPool,
}

#[async_trait]
impl AgentConfigRepository for PostgresAgentConfigRepository {
    async fn find_by_product(
        &self,
        product_id: Uuid,
    ) -> Result<Option<AgentConfigRecord>, sqlx::Error> {
        let result = sqlx::query_as::<_, AgentConfigRecord>(
            r#"
            SELECT product_id,
                   provider,
                   model,
                   temperature,
                   max_tokens,
                   system_prompt,
                   behavior_rules,
                   session_key_template,
                   context_window,
                   retention_days,
                   enabled_tools,
                   credentials,
                   updated_at
            FROM agent_configurations
            WHERE product_id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    async fn upsert(&self, record: &AgentConfigRecord) -> Result<AgentConfigRecord, sqlx::Error> {
        let result = sqlx::query_as::<_, AgentConfigRecord>(
            r#"
            INSERT INTO agent_configurations (
                product_id, provider, model, temperature, max_tokens, system_prompt,
                behavior_rules, session_key_template, context_window, retention_days,
                enabled_tools, credentials, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now(), now())
            ON CONFLICT (product_id) DO UPDATE
            SET provider = EXCLUDED.provider,
                model = EXCLUDED.model,
                temperature = EXCLUDED.temperature,
                max_tokens = EXCLUDED.max_tokens,
                system_prompt = EXCLUDED.system_prompt,
                behavior_rules = EXCLUDED.behavior_rules,
                session_key_template = EXCLUDED.session_key_template,
                context_window = EXCLUDED.context_window,
                retention_days = EXCLUDED.retention_days,
                enabled_tools = EXCLUDED.enabled_tools,
                credentials = EXCLUDED.credentials,
                updated_at = now()
            RETURNING product_id, provider, model, temperature, max_tokens, system_prompt,
                      behavior_rules, session_key_template, context_window, retention_days,
                      enabled_tools, credentials, updated_at
            "#,
        )
        .bind(record.product_id)
        .bind(&record.provider)
        .bind(&record.model)
        .bind(record.temperature)
        .bind(record.max_tokens)
        .bind(&record.system_prompt)
        .bind(&record.behavior_rules)
        .bind(&record.session_key_template)
        .bind(record.context_window)
        .bind(record.retention_days)
        .bind(&record.enabled_tools)
        .bind(&record.credentials)
        .fetch_one(&self.pool)
        .await?;

        Ok(result)
    }
}
