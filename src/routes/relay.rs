//! Built-in relay: the trusted side of the engine client. It holds the n8n
//! API key and turns relay actions into REST calls.

use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::models::agent_config::AgentProjection;
use crate::responses::JsonResponse;
use crate::services::engine::EngineAction;
use crate::services::n8n::{N8nClient, N8nError};
use crate::state::AppState;
use crate::utils::auth::bearer_matches;

const DEFAULT_LIST_LIMIT: u32 = 50;

#[derive(Debug)]
enum RelayError {
    BadParams(String),
    Upstream(N8nError),
}

impl From<N8nError> for RelayError {
    fn from(err: N8nError) -> Self {
        RelayError::Upstream(err)
    }
}

fn str_param<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str, RelayError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| RelayError::BadParams(format!("{key} is required")))
}

fn limit_param(params: &Map<String, Value>) -> u32 {
    params
        .get("limit")
        .and_then(Value::as_u64)
        .map(|limit| limit.clamp(1, 250) as u32)
        .unwrap_or(DEFAULT_LIST_LIMIT)
}

async fn dispatch(
    n8n: &N8nClient,
    action: EngineAction,
    params: &Map<String, Value>,
) -> Result<Value, RelayError> {
    let payload = match action {
        EngineAction::TestConnection => {
            n8n.list_workflows(1).await?;
            json!({})
        }
        EngineAction::ListWorkflows => {
            json!({ "workflows": n8n.list_workflows(limit_param(params)).await? })
        }
        EngineAction::GetWorkflow => {
            json!({ "workflow": n8n.get_workflow(str_param(params, "workflowId")?).await? })
        }
        EngineAction::GetExecutions => {
            let workflow_id = str_param(params, "workflowId")?;
            json!({ "executions": n8n.list_executions(workflow_id, limit_param(params)).await? })
        }
        EngineAction::GetExecution => {
            json!({ "execution": n8n.get_execution(str_param(params, "executionId")?).await? })
        }
        EngineAction::ActivateWorkflow => {
            json!({ "workflow": n8n.activate_workflow(str_param(params, "workflowId")?).await? })
        }
        EngineAction::DeactivateWorkflow => {
            json!({ "workflow": n8n.deactivate_workflow(str_param(params, "workflowId")?).await? })
        }
        EngineAction::UpdateAgentConfig => {
            let workflow_id = str_param(params, "workflowId")?;
            let projection: AgentProjection = params
                .get("config")
                .cloned()
                .ok_or_else(|| RelayError::BadParams("config is required".into()))
                .and_then(|config| {
                    serde_json::from_value(config)
                        .map_err(|err| RelayError::BadParams(format!("invalid config: {err}")))
                })?;
            json!({ "workflow": n8n.push_projection(workflow_id, &projection).await? })
        }
    };
    Ok(payload)
}

/// Body is `{ "action": ..., ...params }`. Failures carry a `code` so the
/// caller can tell an unreachable or misconfigured engine from a rejection.
pub async fn handle_relay(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !bearer_matches(&headers, &state.config.relay_token) {
        return JsonResponse::unauthorized("Invalid relay token").into_response();
    }
    let Value::Object(params) = body else {
        return JsonResponse::bad_request("Relay body must be a JSON object").into_response();
    };
    let Some(action) = params
        .get("action")
        .and_then(Value::as_str)
        .and_then(EngineAction::parse)
    else {
        return JsonResponse::bad_request("Unknown relay action").into_response();
    };
    let Some(n8n) = state.n8n.as_ref() else {
        return JsonResponse::service_unavailable(
            "Workflow engine is not configured",
            "connection_error",
        )
        .into_response();
    };

    match dispatch(n8n, action, &params).await {
        Ok(Value::Object(mut payload)) => {
            payload.insert("success".to_string(), Value::Bool(true));
            info!(%action, "relay action completed");
            Json(Value::Object(payload)).into_response()
        }
        Ok(other) => Json(json!({ "success": true, "data": other })).into_response(),
        Err(RelayError::BadParams(msg)) => JsonResponse::bad_request(&msg).into_response(),
        Err(RelayError::Upstream(err)) if err.is_auth_error() => {
            error!(%action, error = %err, "n8n rejected the API key");
            JsonResponse::bad_gateway("n8n rejected the configured API key", "auth_error")
                .into_response()
        }
        Err(RelayError::Upstream(err)) if err.is_unavailable() => {
            warn!(%action, error = %err, "n8n unavailable");
            JsonResponse::service_unavailable(&err.to_string(), "connection_error").into_response()
        }
        Err(RelayError::Upstream(err)) => {
            warn!(%action, error = %err, "n8n rejected relay action");
            JsonResponse::unprocessable(&err.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::routes::app;
    use crate::services::engine::mock::MockRelay;
    use crate::state::test_support::{
        test_config, test_state, test_state_with_config, TestRepos, RELAY_TOKEN,
    };
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use httpmock::prelude::*;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn relay_request(token: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/relay")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn unused_relay() -> MockRelay {
        MockRelay::new(|_, _| Ok(json!({"success": true})))
    }

    #[tokio::test]
    async fn rejects_wrong_relay_token() {
        let repos = TestRepos::default();
        let app = app(test_state(unused_relay(), &repos));

        let resp = app
            .oneshot(relay_request("nope", json!({"action": "test_connection"})))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unconfigured_engine_is_a_connection_error() {
        let repos = TestRepos::default();
        let app = app(test_state(unused_relay(), &repos));

        let resp = app
            .oneshot(relay_request(RELAY_TOKEN, json!({"action": "test_connection"})))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["code"], "connection_error");
    }

    #[tokio::test]
    async fn unknown_action_is_a_bad_request() {
        let server = MockServer::start();
        let repos = TestRepos::default();
        let config = test_config(Some(&server.url("/api/v1")));
        let app = app(test_state_with_config(config, unused_relay(), &repos));

        let resp = app
            .oneshot(relay_request(RELAY_TOKEN, json!({"action": "delete_everything"})))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_workflow_wraps_the_n8n_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/workflows/wf-42")
                .header("X-N8N-API-KEY", "n8n-key");
            then.status(200)
                .json_body(json!({"id": "wf-42", "name": "Support agent", "active": true}));
        });
        let repos = TestRepos::default();
        let config = test_config(Some(&server.url("/api/v1")));
        let app = app(test_state_with_config(config, unused_relay(), &repos));

        let resp = app
            .oneshot(relay_request(
                RELAY_TOKEN,
                json!({"action": "get_workflow", "workflowId": "wf-42"}),
            ))
            .await
            .unwrap();

        mock.assert();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["workflow"]["active"], true);
    }

    #[tokio::test]
    async fn missing_workflow_id_is_a_bad_request() {
        let server = MockServer::start();
        let repos = TestRepos::default();
        let config = test_config(Some(&server.url("/api/v1")));
        let app = app(test_state_with_config(config, unused_relay(), &repos));

        let resp = app
            .oneshot(relay_request(RELAY_TOKEN, json!({"action": "activate_workflow"})))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["success"], false);
    }

    #[tokio::test]
    async fn upstream_rejection_maps_to_codes() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/v1/workflows/wf-42/activate");
            then.status(400)
                .json_body(json!({"message": "Workflow has no trigger node"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/workflows/wf-401");
            then.status(401).json_body(json!({"message": "unauthorized"}));
        });
        let repos = TestRepos::default();
        let config = test_config(Some(&server.url("/api/v1")));
        let state = test_state_with_config(config, unused_relay(), &repos);

        let rejected = app(state.clone())
            .oneshot(relay_request(
                RELAY_TOKEN,
                json!({"action": "activate_workflow", "workflowId": "wf-42"}),
            ))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = json_body(rejected).await;
        assert!(json["message"]
            .as_str()
            .unwrap()
            .contains("Workflow has no trigger node"));
        assert!(json["code"].is_null());

        let auth = app(state)
            .oneshot(relay_request(
                RELAY_TOKEN,
                json!({"action": "get_workflow", "workflowId": "wf-401"}),
            ))
            .await
            .unwrap();
        assert_eq!(auth.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(auth).await["code"], "auth_error");
    }
}
