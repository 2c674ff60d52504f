use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::agents::{SaveError, SyncError};
use crate::models::agent_config::AgentConfiguration;
use crate::responses::JsonResponse;
use crate::state::AppState;

pub async fn get_config(State(state): State<AppState>, Path(product_id): Path<Uuid>) -> Response {
    match state.synchronizer.load(product_id).await {
        // Credentials serialize redacted.
        Ok(Some(config)) => Json(json!({ "success": true, "config": config })).into_response(),
        Ok(None) => JsonResponse::not_found("No agent configuration for this product").into_response(),
        Err(err) => {
            error!(%product_id, error = %err, "failed to load agent configuration");
            JsonResponse::server_error("Failed to load agent configuration").into_response()
        }
    }
}

pub async fn put_config(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(mut config): Json<AgentConfiguration>,
) -> Response {
    config.product_id = product_id;
    match state.synchronizer.save_and_sync(config).await {
        Ok(outcome) => Json(json!({
            "success": true,
            "saved": true,
            "synced": outcome.synced,
            "workflowId": outcome.workflow_id,
            "warning": outcome.warning,
            "config": outcome.config,
        }))
        .into_response(),
        Err(SaveError::Validation(msg)) => JsonResponse::bad_request(&msg).into_response(),
        Err(err) => JsonResponse::server_error(&err.to_string()).into_response(),
    }
}

/// Retries the remote push alone from the stored configuration.
pub async fn sync_config(State(state): State<AppState>, Path(product_id): Path<Uuid>) -> Response {
    match state.synchronizer.sync_product(product_id).await {
        Ok(workflow_id) => Json(json!({
            "success": true,
            "synced": true,
            "workflowId": workflow_id,
        }))
        .into_response(),
        Err(err @ (SyncError::NotConfigured(_) | SyncError::Unbound(_))) => {
            JsonResponse::not_found(&err.to_string()).into_response()
        }
        Err(SyncError::InvalidWorkflow) => {
            JsonResponse::bad_request("Bound workflow id is empty").into_response()
        }
        Err(SyncError::Engine(err)) => Json(json!({
            "success": true,
            "synced": false,
            "warning": format!("remote sync failed: {err}"),
        }))
        .into_response(),
        Err(err) => {
            error!(%product_id, error = %err, "agent configuration sync could not start");
            JsonResponse::server_error(&err.to_string()).into_response()
        }
    }
}
