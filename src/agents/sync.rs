//! Local agent configuration is the source of truth; the remote workflow only
//! ever receives a projection rebuilt in full from it.

use std::collections::BTreeMap;
use std::sync::Arc;

use sqlx::types::Json;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::agent_config_repository::AgentConfigRepository;
use crate::db::workflow_binding_repository::WorkflowBindingRepository;
use crate::models::agent_config::{
    AgentConfigRecord, AgentConfiguration, AgentProjection, MemoryPolicy,
};
use crate::services::engine::{EngineClient, EngineError};
use crate::utils::credentials::{CapabilityId, CredentialError, CredentialMap};
use crate::utils::encryption::{open_stored, seal_for_storage, CredentialCipher, EncryptionError};

const RULES_HEADING: &str = "Behavior rules:";

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("invalid agent configuration: {0}")]
    Validation(String),
    #[error("credentials could not be sealed: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("stored credentials are unreadable: {0}")]
    Credentials(#[from] CredentialError),
    #[error("agent configuration could not be persisted: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("workflow id must not be empty")]
    InvalidWorkflow,
    #[error("no agent configuration saved for product {0}")]
    NotConfigured(Uuid),
    #[error("no workflow is bound to product {0}")]
    Unbound(Uuid),
    #[error("agent configuration could not be loaded: {0}")]
    Load(#[from] SaveError),
    #[error("binding lookup failed: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("projection push failed: {0}")]
    Engine(#[from] EngineError),
}

/// Result of a save followed by a best-effort sync. A failed sync is a
/// warning, never a failed save.
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub config: AgentConfiguration,
    pub workflow_id: Option<String>,
    pub synced: bool,
    pub warning: Option<String>,
}

#[derive(Clone)]
pub struct ConfigSynchronizer {
    configs: Arc<dyn AgentConfigRepository>,
    bindings: Arc<dyn WorkflowBindingRepository>,
    engine: EngineClient,
    cipher: Option<CredentialCipher>,
}

impl ConfigSynchronizer {
    pub fn new(
        configs: Arc<dyn AgentConfigRepository>,
        bindings: Arc<dyn WorkflowBindingRepository>,
        engine: EngineClient,
        cipher: Option<CredentialCipher>,
    ) -> Self {
        Self {
            configs,
            bindings,
            engine,
            cipher,
        }
    }

    pub async fn load(&self, product_id: Uuid) -> Result<Option<AgentConfiguration>, SaveError> {
        match self.configs.find_by_product(product_id).await? {
            Some(record) => from_record(record, self.cipher.as_ref()).map(Some),
            None => Ok(None),
        }
    }

    /// Persists the configuration. Secrets sent back as the redacted
    /// placeholder keep their stored value. Concurrent saves are
    /// last-write-wins.
    pub async fn save(&self, mut config: AgentConfiguration) -> Result<AgentConfiguration, SaveError> {
        config.validate().map_err(SaveError::Validation)?;

        let previous = self
            .load(config.product_id)
            .await
            .inspect_err(|err| error!(product_id = %config.product_id, error = %err, "failed to read stored configuration"))?
            .map(|existing| existing.credentials)
            .unwrap_or_default();
        config.credentials.restore_redacted(&previous);

        let record = to_record(&config, self.cipher.as_ref())?;
        let stored = self.configs.upsert(&record).await.map_err(|err| {
            error!(product_id = %config.product_id, error = %err, "failed to persist agent configuration");
            SaveError::from(err)
        })?;

        config.updated_at = Some(stored.updated_at);
        info!(product_id = %config.product_id, "agent configuration saved");
        Ok(config)
    }

    /// Pushes the full projection of `config`. Safe to retry at any time.
    pub async fn sync(&self, workflow_id: &str, config: &AgentConfiguration) -> Result<(), SyncError> {
        let workflow_id = workflow_id.trim();
        if workflow_id.is_empty() {
            return Err(SyncError::InvalidWorkflow);
        }
        let projection = project(config);
        self.engine
            .update_agent_config(workflow_id, &projection)
            .await
            .inspect_err(|err| warn!(workflow_id, product_id = %config.product_id, error = %err, "agent configuration sync failed"))?;
        info!(workflow_id, product_id = %config.product_id, "agent configuration synced");
        Ok(())
    }

    /// Re-reads the stored configuration and pushes it to the bound workflow.
    pub async fn sync_product(&self, product_id: Uuid) -> Result<String, SyncError> {
        let config = self
            .load(product_id)
            .await?
            .ok_or(SyncError::NotConfigured(product_id))?;
        let binding = self
            .bindings
            .find_binding_for_product(product_id)
            .await?
            .ok_or(SyncError::Unbound(product_id))?;
        self.sync(&binding.workflow_id, &config).await?;
        Ok(binding.workflow_id)
    }

    pub async fn save_and_sync(&self, config: AgentConfiguration) -> Result<SaveOutcome, SaveError> {
        let saved = self.save(config).await?;
        let product_id = saved.product_id;

        let binding = match self.bindings.find_binding_for_product(product_id).await {
            Ok(binding) => binding,
            Err(err) => {
                warn!(%product_id, error = %err, "binding lookup failed after save");
                return Ok(SaveOutcome {
                    config: saved,
                    workflow_id: None,
                    synced: false,
                    warning: Some(format!("saved locally; binding lookup failed: {err}")),
                });
            }
        };
        let Some(binding) = binding else {
            debug!(%product_id, "no workflow bound, skipping sync");
            return Ok(SaveOutcome {
                config: saved,
                workflow_id: None,
                synced: false,
                warning: Some("saved locally; no workflow is bound to this product".into()),
            });
        };

        let (synced, warning) = match self.sync(&binding.workflow_id, &saved).await {
            Ok(()) => (true, None),
            Err(err) => (false, Some(format!("saved locally; remote sync failed: {err}"))),
        };
        Ok(SaveOutcome {
            config: saved,
            workflow_id: Some(binding.workflow_id),
            synced,
            warning,
        })
    }
}

/// Pure projection of a configuration into what the workflow receives.
/// Credential and tool ordering in the input does not affect the output.
pub fn project(config: &AgentConfiguration) -> AgentProjection {
    let mut credentials = BTreeMap::new();
    for (id, _) in config.credentials.iter() {
        let secret = match config.credentials.require(id) {
            Ok(secret) => secret,
            Err(err) => {
                debug!(error = %err, "leaving credential out of projection");
                continue;
            }
        };
        let key = match id {
            CapabilityId::Provider(name) => format!("{name}_api_key"),
            CapabilityId::Tool(name) => name.clone(),
        };
        credentials.insert(key, secret.to_string());
    }

    let mut tools: Vec<String> = config
        .enabled_tools
        .iter()
        .map(|tool| tool.trim().to_string())
        .filter(|tool| !tool.is_empty())
        .collect();
    tools.sort();
    tools.dedup();

    AgentProjection {
        provider: config.provider.trim().to_string(),
        model: config.model.trim().to_string(),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        system_prompt: compose_system_prompt(config),
        session_key: config.memory.session_key_template.clone(),
        context_window: config.memory.context_window,
        retention_days: config.memory.retention_days,
        tools,
        credentials,
    }
}

fn compose_system_prompt(config: &AgentConfiguration) -> String {
    let base = config.system_prompt.trim();
    let rules: Vec<String> = config
        .behavior_rules
        .iter()
        .filter(|rule| !rule.instruction.trim().is_empty())
        .map(|rule| format!("{} {}", rule.kind.marker(), rule.instruction.trim()))
        .collect();
    if rules.is_empty() {
        return base.to_string();
    }

    let block = format!("{RULES_HEADING}\n{}", rules.join("\n"));
    if base.is_empty() {
        block
    } else {
        format!("{base}\n\n{block}")
    }
}

pub fn to_record(
    config: &AgentConfiguration,
    cipher: Option<&CredentialCipher>,
) -> Result<AgentConfigRecord, SaveError> {
    let credentials = seal_for_storage(cipher, &config.credentials.to_blob())?;
    Ok(AgentConfigRecord {
        product_id: config.product_id,
        provider: config.provider.trim().to_string(),
        model: config.model.trim().to_string(),
        temperature: config.temperature,
        max_tokens: i32::try_from(config.max_tokens).unwrap_or(i32::MAX),
        system_prompt: config.system_prompt.clone(),
        behavior_rules: Json(config.behavior_rules.clone()),
        session_key_template: config.memory.session_key_template.clone(),
        context_window: i32::try_from(config.memory.context_window).unwrap_or(i32::MAX),
        retention_days: config
            .memory
            .retention_days
            .map(|days| i32::try_from(days).unwrap_or(i32::MAX)),
        enabled_tools: Json(config.enabled_tools.clone()),
        credentials,
        updated_at: config.updated_at.unwrap_or_else(chrono::Utc::now),
    })
}

pub fn from_record(
    record: AgentConfigRecord,
    cipher: Option<&CredentialCipher>,
) -> Result<AgentConfiguration, SaveError> {
    let blob = open_stored(cipher, &record.credentials)?;
    let credentials = CredentialMap::from_blob(&blob)?;
    Ok(AgentConfiguration {
        product_id: record.product_id,
        provider: record.provider,
        model: record.model,
        temperature: record.temperature,
        max_tokens: u32::try_from(record.max_tokens).unwrap_or(0),
        system_prompt: record.system_prompt,
        behavior_rules: record.behavior_rules.0,
        memory: MemoryPolicy {
            session_key_template: record.session_key_template,
            context_window: u32::try_from(record.context_window).unwrap_or(0),
            retention_days: record
                .retention_days
                .and_then(|days| u32::try_from(days).ok()),
        },
        enabled_tools: record.enabled_tools.0,
        credentials,
        updated_at: Some(record.updated_at),
    })
}
