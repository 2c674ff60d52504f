use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};

use crate::agents::ActivationError;
use crate::models::activation::ActivationState;
use crate::responses::JsonResponse;
use crate::routes::engine_error_response;
use crate::state::AppState;

fn state_response(state: &ActivationState, reconciled: bool, warning: Option<String>) -> Response {
    Json(json!({
        "success": true,
        "reconciled": reconciled,
        "drift": state.drift(),
        "warning": warning,
        "activation": state,
    }))
    .into_response()
}

fn error_response(workflow_id: &str, err: &ActivationError) -> Response {
    match err {
        ActivationError::Validation(msg) => JsonResponse::not_found(msg).into_response(),
        ActivationError::Engine(err) => engine_error_response(err),
        ActivationError::Storage(err) => {
            error!(workflow_id, error = %err, "failed to store activation flag");
            JsonResponse::server_error_with_code(
                "Engine updated but the local flag could not be stored",
                "local_write_failed",
            )
            .into_response()
        }
    }
}

/// Reads the remote state. When the engine cannot be reached the last known
/// state is returned instead, flagged as not reconciled.
pub async fn get_activation(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Response {
    match state.reconciler.poll(&workflow_id).await {
        Ok(activation) => state_response(&activation, true, None),
        Err(ActivationError::Engine(err)) => {
            warn!(%workflow_id, error = %err, "activation poll failed, serving last known state");
            match state.reconciler.state(&workflow_id).await {
                Ok(activation) => state_response(&activation, false, Some(err.to_string())),
                Err(err) => error_response(&workflow_id, &err),
            }
        }
        Err(err) => error_response(&workflow_id, &err),
    }
}

pub async fn activate_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Response {
    match state.reconciler.activate(&workflow_id).await {
        Ok(activation) => state_response(&activation, false, None),
        Err(err) => error_response(&workflow_id, &err),
    }
}

pub async fn deactivate_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Response {
    match state.reconciler.deactivate(&workflow_id).await {
        Ok(activation) => state_response(&activation, false, None),
        Err(err) => error_response(&workflow_id, &err),
    }
}
