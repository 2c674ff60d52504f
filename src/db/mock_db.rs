use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::agent_config_repository::AgentConfigRepository;
use super::daily_usage_repository::DailyUsageRepository;
use super::workflow_binding_repository::WorkflowBindingRepository;
use crate::models::agent_config::AgentConfigRecord;
use crate::models::usage::DailyUsageRecord;
use crate::models::workflow_binding::WorkflowBinding;

#[derive(Default)]
pub struct InMemoryAgentConfigRepository {
    pub rows: Mutex<HashMap<Uuid, AgentConfigRecord>>,
    pub should_fail: bool,
}

impl InMemoryAgentConfigRepository {
    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn stored(&self, product_id: Uuid) -> Option<AgentConfigRecord> {
        self.rows.lock().unwrap().get(&product_id).cloned()
    }
}

#[async_trait]
impl AgentConfigRepository for InMemoryAgentConfigRepository {
    async fn find_by_product(
        &self,
        product_id: Uuid,
    ) -> Result<Option<AgentConfigRecord>, sqlx::Error> {
        if self.should_fail {
            return Err(sqlx::Error::Protocol("Mock DB failure".into()));
        }
        Ok(self.rows.lock().unwrap().get(&product_id).cloned())
    }

    async fn upsert(&self, record: &AgentConfigRecord) -> Result<AgentConfigRecord, sqlx::Error> {
        if self.should_fail {
            return Err(sqlx::Error::Protocol("Mock DB failure".into()));
        }
        let mut stored = record.clone();
        stored.updated_at = Utc::now();
        self.rows
            .lock()
            .unwrap()
            .insert(record.product_id, stored.clone());
        Ok(stored)
    }
}

#[derive(Default)]
pub struct InMemoryWorkflowBindingRepository {
    pub bindings: Mutex<HashMap<String, WorkflowBinding>>,
}

impl InMemoryWorkflowBindingRepository {
    pub fn with_binding(binding: WorkflowBinding) -> Self {
        let repo = Self::default();
        repo.bindings
            .lock()
            .unwrap()
            .insert(binding.workflow_id.clone(), binding);
        repo
    }

    pub fn binding(workflow_id: &str, product_id: Uuid, is_active: bool) -> WorkflowBinding {
        WorkflowBinding {
            workflow_id: workflow_id.to_string(),
            product_id,
            is_active,
            webhook_url: None,
            last_reconciled_at: None,
        }
    }

    pub fn local_flag(&self, workflow_id: &str) -> Option<bool> {
        self.bindings
            .lock()
            .unwrap()
            .get(workflow_id)
            .map(|b| b.is_active)
    }
}

#[async_trait]
impl WorkflowBindingRepository for InMemoryWorkflowBindingRepository {
    async fn find_binding(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowBinding>, sqlx::Error> {
        Ok(self.bindings.lock().unwrap().get(workflow_id).cloned())
    }

    async fn list_bindings(&self) -> Result<Vec<WorkflowBinding>, sqlx::Error> {
        let mut rows: Vec<WorkflowBinding> =
            self.bindings.lock().unwrap().values().cloned().collect();
        rows.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        Ok(rows)
    }

    async fn find_binding_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Option<WorkflowBinding>, sqlx::Error> {
        Ok(self
            .bindings
            .lock()
            .unwrap()
            .values()
            .find(|b| b.product_id == product_id)
            .cloned())
    }

    async fn set_local_active(
        &self,
        workflow_id: &str,
        is_active: bool,
    ) -> Result<bool, sqlx::Error> {
        match self.bindings.lock().unwrap().get_mut(workflow_id) {
            Some(binding) => {
                binding.is_active = is_active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_reconciled(
        &self,
        workflow_id: &str,
        reconciled_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        if let Some(binding) = self.bindings.lock().unwrap().get_mut(workflow_id) {
            binding.last_reconciled_at = Some(reconciled_at);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDailyUsageRepository {
    pub records: Vec<DailyUsageRecord>,
    pub should_fail: bool,
}

impl InMemoryDailyUsageRepository {
    pub fn with_records(records: Vec<DailyUsageRecord>) -> Self {
        Self {
            records,
            should_fail: false,
        }
    }
}

#[async_trait]
impl DailyUsageRepository for InMemoryDailyUsageRepository {
    async fn list_range(
        &self,
        workflow_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyUsageRecord>, sqlx::Error> {
        if self.should_fail {
            return Err(sqlx::Error::Protocol("Mock DB failure".into()));
        }
        let mut rows: Vec<DailyUsageRecord> = self
            .records
            .iter()
            .filter(|r| r.workflow_id == workflow_id && r.date >= from && r.date <= to)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.date);
        Ok(rows)
    }
}
