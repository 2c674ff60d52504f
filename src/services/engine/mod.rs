//! Client for the external workflow engine, reached only through the trusted
//! relay's named-action protocol: `{action, ...params}` in,
//! `{success, ...payload}` out.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::workflow::{ExecutionSummary, WorkflowDescriptor};

#[cfg(test)]
pub mod mock;
pub mod relay;

pub use relay::HttpRelay;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("workflow engine unreachable: {0}")]
    Connection(String),
    #[error("workflow engine rejected {action}: {message}")]
    Action { action: String, message: String },
    #[error("relay credentials rejected: {0}")]
    Auth(String),
    #[error("workflow engine returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Connection(_))
    }

    pub fn action(action: EngineAction, message: impl Into<String>) -> Self {
        EngineError::Action {
            action: action.as_str().to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineAction {
    TestConnection,
    ListWorkflows,
    GetWorkflow,
    GetExecutions,
    GetExecution,
    ActivateWorkflow,
    DeactivateWorkflow,
    UpdateAgentConfig,
}

impl EngineAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineAction::TestConnection => "test_connection",
            EngineAction::ListWorkflows => "list_workflows",
            EngineAction::GetWorkflow => "get_workflow",
            EngineAction::GetExecutions => "get_executions",
            EngineAction::GetExecution => "get_execution",
            EngineAction::ActivateWorkflow => "activate_workflow",
            EngineAction::DeactivateWorkflow => "deactivate_workflow",
            EngineAction::UpdateAgentConfig => "update_agent_config",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "test_connection" => Some(EngineAction::TestConnection),
            "list_workflows" => Some(EngineAction::ListWorkflows),
            "get_workflow" => Some(EngineAction::GetWorkflow),
            "get_executions" => Some(EngineAction::GetExecutions),
            "get_execution" => Some(EngineAction::GetExecution),
            "activate_workflow" => Some(EngineAction::ActivateWorkflow),
            "deactivate_workflow" => Some(EngineAction::DeactivateWorkflow),
            "update_agent_config" => Some(EngineAction::UpdateAgentConfig),
            _ => None,
        }
    }
}

impl fmt::Display for EngineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire for one relay round trip. Implementations must not touch local state.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn invoke(&self, action: EngineAction, params: Value) -> Result<Value, EngineError>;
}

/// Interprets a relay response body. Error codes let the relay tell apart
/// upstream outages and upstream credential failures from plain rejections.
pub fn unwrap_envelope(action: EngineAction, body: Value) -> Result<Value, EngineError> {
    match body.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(body),
        Some(false) => {
            let message = body
                .get("error")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            match body.get("code").and_then(Value::as_str) {
                Some("auth_error") => Err(EngineError::Auth(message)),
                Some("connection_error") => Err(EngineError::Connection(message)),
                _ => Err(EngineError::action(action, message)),
            }
        }
        None => Err(EngineError::InvalidResponse(format!(
            "{action} response is missing the success flag"
        ))),
    }
}

#[derive(Clone)]
pub struct EngineClient {
    transport: Arc<dyn RelayTransport>,
}

impl EngineClient {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self { transport }
    }

    pub async fn invoke(&self, action: EngineAction, params: Value) -> Result<Value, EngineError> {
        debug!(%action, "invoking relay action");
        let result = self.transport.invoke(action, params).await;
        if let Err(err) = &result {
            warn!(%action, error = %err, "relay action failed");
        }
        result
    }

    pub async fn test_connection(&self) -> Result<(), EngineError> {
        self.invoke(EngineAction::TestConnection, json!({}))
            .await
            .map(|_| ())
    }

    pub async fn list_workflows(&self, limit: u32) -> Result<Vec<WorkflowDescriptor>, EngineError> {
        let payload = self
            .invoke(EngineAction::ListWorkflows, json!({ "limit": limit }))
            .await?;
        let items = payload_array(&payload, &["workflows", "data"]).ok_or_else(|| {
            EngineError::InvalidResponse("list_workflows payload has no workflow list".into())
        })?;
        Ok(items
            .iter()
            .filter_map(WorkflowDescriptor::from_engine)
            .collect())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowDescriptor, EngineError> {
        let payload = self
            .invoke(EngineAction::GetWorkflow, json!({ "workflowId": workflow_id }))
            .await?;
        payload_object(&payload, &["workflow", "data"])
            .and_then(WorkflowDescriptor::from_engine)
            .ok_or_else(|| {
                EngineError::InvalidResponse("get_workflow payload has no workflow".into())
            })
    }

    /// Summaries that cannot be parsed are dropped rather than failing the list.
    pub async fn get_executions(
        &self,
        workflow_id: &str,
        limit: u32,
    ) -> Result<Vec<ExecutionSummary>, EngineError> {
        let payload = self
            .invoke(
                EngineAction::GetExecutions,
                json!({ "workflowId": workflow_id, "limit": limit }),
            )
            .await?;
        let items = payload_array(&payload, &["executions", "data"]).ok_or_else(|| {
            EngineError::InvalidResponse("get_executions payload has no execution list".into())
        })?;

        let mut summaries = Vec::with_capacity(items.len());
        for item in items {
            match ExecutionSummary::from_engine(item) {
                Some(mut summary) => {
                    if summary.workflow_id.is_empty() {
                        summary.workflow_id = workflow_id.to_string();
                    }
                    summaries.push(summary);
                }
                None => debug!(workflow_id, "skipping unparseable execution summary"),
            }
        }
        Ok(summaries)
    }

    /// Raw execution detail, including the per-node run data.
    pub async fn get_execution(&self, execution_id: &str) -> Result<Value, EngineError> {
        let payload = self
            .invoke(EngineAction::GetExecution, json!({ "executionId": execution_id }))
            .await?;
        payload_object(&payload, &["execution", "data"])
            .cloned()
            .ok_or_else(|| {
                EngineError::InvalidResponse("get_execution payload has no execution".into())
            })
    }

    pub async fn activate_workflow(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.invoke(
            EngineAction::ActivateWorkflow,
            json!({ "workflowId": workflow_id }),
        )
        .await
        .map(|_| ())
    }

    pub async fn deactivate_workflow(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.invoke(
            EngineAction::DeactivateWorkflow,
            json!({ "workflowId": workflow_id }),
        )
        .await
        .map(|_| ())
    }

    pub async fn update_agent_config<P: Serialize + Sync>(
        &self,
        workflow_id: &str,
        projection: &P,
    ) -> Result<(), EngineError> {
        let projection = serde_json::to_value(projection)
            .map_err(|err| EngineError::InvalidResponse(err.to_string()))?;
        self.invoke(
            EngineAction::UpdateAgentConfig,
            json!({ "workflowId": workflow_id, "config": projection }),
        )
        .await
        .map(|_| ())
    }
}

fn payload_array<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    keys.iter().find_map(|key| payload.get(*key)?.as_array())
}

fn payload_object<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| payload.get(*key).filter(|value| value.is_object()))
}
