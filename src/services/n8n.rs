use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::sleep;

use crate::models::agent_config::AgentProjection;

const N8N_API_KEY_HEADER: &str = "X-N8N-API-KEY";
const N8N_MAX_RETRIES: usize = 3;
const N8N_BACKOFF_BASE_MS: u64 = 250;
const N8N_BACKOFF_MAX_MS: u64 = 2000;

/// Workflow fields the public API accepts on update; anything else in a
/// fetched workflow (ids, timestamps, tags) is rejected by the upstream.
const UPDATABLE_WORKFLOW_FIELDS: &[&str] = &["name", "nodes", "connections", "settings", "staticData"];

#[derive(Debug, Error)]
pub enum N8nError {
    #[error("n8n API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("n8n API responded with status {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("n8n API returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl N8nError {
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            N8nError::Api { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }

    /// Transport failures and upstream 5xx mean the engine itself is down.
    pub fn is_unavailable(&self) -> bool {
        match self {
            N8nError::Http(_) => true,
            N8nError::Api { status, .. } => status.is_server_error(),
            N8nError::InvalidResponse(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct N8nErrorBody {
    message: Option<String>,
}

/// Thin client for the n8n public REST API. `base_url` is the API root,
/// e.g. `https://n8n.example.com/api/v1`.
#[derive(Clone)]
pub struct N8nClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for N8nClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("N8nClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Wait before retrying a 429. Upstream hints are honored up to the
/// backoff ceiling so one response cannot stall a poll indefinitely.
fn retry_delay(retry_after: Option<&str>, backoff: Duration) -> Duration {
    retry_after
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(backoff)
        .min(Duration::from_millis(N8N_BACKOFF_MAX_MS))
}

fn build_url(base: &str, path: &str) -> String {
    let trimmed_base = base.trim_end_matches('/');
    let trimmed_path = path.trim_start_matches('/');
    format!("{}/{}", trimmed_base, trimmed_path)
}

impl N8nClient {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, build_url(&self.base_url, path))
            .header(N8N_API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, N8nError> {
        let mut retries = 0usize;
        let mut backoff = Duration::from_millis(N8N_BACKOFF_BASE_MS);

        loop {
            let request = request.try_clone().ok_or_else(|| {
                N8nError::InvalidResponse("n8n request could not be retried".into())
            })?;
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS && retries < N8N_MAX_RETRIES {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok());
                sleep(retry_delay(retry_after, backoff)).await;
                retries += 1;
                backoff = Duration::from_millis(
                    (backoff.as_millis() as u64 * 2).min(N8N_BACKOFF_MAX_MS),
                );
                continue;
            }

            let body = response.text().await.unwrap_or_default();

            if !status.is_success() {
                let message = serde_json::from_str::<N8nErrorBody>(&body)
                    .ok()
                    .and_then(|err| err.message)
                    .map(|msg| msg.trim().to_string())
                    .filter(|msg| !msg.is_empty())
                    .or_else(|| {
                        let trimmed = body.trim();
                        (!trimmed.is_empty()).then(|| trimmed.to_string())
                    })
                    .unwrap_or_else(|| "n8n API request failed".to_string());
                return Err(N8nError::Api { status, message });
            }

            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str::<Value>(&body)
                .map_err(|err| N8nError::InvalidResponse(err.to_string()));
        }
    }

    /// Returns the `data` array of the first page.
    pub async fn list_workflows(&self, limit: u32) -> Result<Vec<Value>, N8nError> {
        let request = self
            .request(Method::GET, "workflows")
            .query(&[("limit", limit.to_string())]);
        let body = self.send(request).await?;
        page_data(body)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Value, N8nError> {
        let path = format!("workflows/{}", urlencoding::encode(workflow_id));
        self.send(self.request(Method::GET, &path)).await
    }

    pub async fn list_executions(
        &self,
        workflow_id: &str,
        limit: u32,
    ) -> Result<Vec<Value>, N8nError> {
        let request = self.request(Method::GET, "executions").query(&[
            ("workflowId", workflow_id.to_string()),
            ("limit", limit.to_string()),
        ]);
        let body = self.send(request).await?;
        page_data(body)
    }

    /// Full execution including per-node run data.
    pub async fn get_execution(&self, execution_id: &str) -> Result<Value, N8nError> {
        let path = format!("executions/{}", urlencoding::encode(execution_id));
        let request = self
            .request(Method::GET, &path)
            .query(&[("includeData", "true")]);
        self.send(request).await
    }

    pub async fn activate_workflow(&self, workflow_id: &str) -> Result<Value, N8nError> {
        let path = format!("workflows/{}/activate", urlencoding::encode(workflow_id));
        self.send(self.request(Method::POST, &path)).await
    }

    pub async fn deactivate_workflow(&self, workflow_id: &str) -> Result<Value, N8nError> {
        let path = format!("workflows/{}/deactivate", urlencoding::encode(workflow_id));
        self.send(self.request(Method::POST, &path)).await
    }

    pub async fn update_workflow(&self, workflow_id: &str, body: &Value) -> Result<Value, N8nError> {
        let path = format!("workflows/{}", urlencoding::encode(workflow_id));
        self.send(self.request(Method::PUT, &path).json(body)).await
    }

    /// Fetches the workflow, rewrites its agent nodes from the projection
    /// and writes it back.
    pub async fn push_projection(
        &self,
        workflow_id: &str,
        projection: &AgentProjection,
    ) -> Result<Value, N8nError> {
        let current = self.get_workflow(workflow_id).await?;
        if !current.is_object() {
            return Err(N8nError::InvalidResponse(
                "workflow response is not an object".into(),
            ));
        }
        let updated = apply_projection(&current, projection);
        self.update_workflow(workflow_id, &updated).await
    }
}

fn page_data(body: Value) -> Result<Vec<Value>, N8nError> {
    match body {
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(N8nError::InvalidResponse("page has no data array".into())),
        },
        Value::Array(items) => Ok(items),
        _ => Err(N8nError::InvalidResponse("expected a paged list".into())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentNodeRole {
    Agent,
    ChatModel,
    Memory,
}

fn node_role(node_type: &str) -> Option<AgentNodeRole> {
    let lowered = node_type.to_ascii_lowercase();
    if !lowered.contains("langchain") {
        return None;
    }
    let suffix = lowered.rsplit('.').next().unwrap_or_default();
    if suffix == "agent" {
        Some(AgentNodeRole::Agent)
    } else if suffix.starts_with("lmchat") {
        Some(AgentNodeRole::ChatModel)
    } else if suffix.starts_with("memory") {
        Some(AgentNodeRole::Memory)
    } else {
        None
    }
}

fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(inner) => inner,
        _ => unreachable!("slot was just replaced with an object"),
    }
}

/// Rewrites a fetched workflow into an update body carrying the projection.
/// Pure: the same workflow and projection always produce the same body.
pub fn apply_projection(workflow: &Value, projection: &AgentProjection) -> Value {
    let mut body = Map::new();
    for field in UPDATABLE_WORKFLOW_FIELDS {
        if let Some(value) = workflow.get(*field) {
            body.insert(field.to_string(), value.clone());
        }
    }
    if !body.get("settings").is_some_and(Value::is_object) {
        body.insert("settings".into(), json!({}));
    }

    if let Some(Value::Array(nodes)) = body.get_mut("nodes") {
        for node in nodes.iter_mut() {
            let Some(role) = node
                .get("type")
                .and_then(Value::as_str)
                .and_then(node_role)
            else {
                continue;
            };
            let Value::Object(node) = node else { continue };
            let params = object_entry(node, "parameters");
            match role {
                AgentNodeRole::Agent => {
                    object_entry(params, "options")
                        .insert("systemMessage".into(), json!(projection.system_prompt));
                }
                AgentNodeRole::ChatModel => {
                    // Resource-locator shape: {"__rl": true, "mode": "list", "value": ...}
                    if let Some(Value::Object(locator)) = params.get_mut("model") {
                        locator.insert("value".into(), json!(projection.model));
                    } else if params.contains_key("modelName") {
                        params.insert("modelName".into(), json!(projection.model));
                    } else {
                        params.insert("model".into(), json!(projection.model));
                    }
                    let options = object_entry(params, "options");
                    options.insert("temperature".into(), json!(projection.temperature));
                    options.insert("maxTokens".into(), json!(projection.max_tokens));
                }
                AgentNodeRole::Memory => {
                    params.insert("sessionIdType".into(), json!("customKey"));
                    params.insert("sessionKey".into(), json!(projection.session_key));
                    params.insert(
                        "contextWindowLength".into(),
                        json!(projection.context_window),
                    );
                }
            }
        }
    }

    let static_data = object_entry(&mut body, "staticData");
    static_data.insert(
        "agentConfig".into(),
        json!({
            "provider": projection.provider,
            "model": projection.model,
            "retentionDays": projection.retention_days,
            "tools": projection.tools,
            "credentials": projection.credentials,
        }),
    );

    Value::Object(body)
}
