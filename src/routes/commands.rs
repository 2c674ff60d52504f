use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use crate::responses::JsonResponse;
use crate::services::webhook::{self, WebhookCommand, WebhookError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: WebhookCommand,
    #[serde(default)]
    pub data: Value,
}

/// Forwards a control command to the webhook registered for the product.
pub async fn send_command(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(request): Json<CommandRequest>,
) -> Response {
    let binding = match state.bindings.find_binding_for_product(product_id).await {
        Ok(Some(binding)) => binding,
        Ok(None) => {
            return JsonResponse::not_found("No workflow is bound to this product").into_response()
        }
        Err(err) => {
            error!(%product_id, error = %err, "binding lookup failed");
            return JsonResponse::server_error("Failed to load workflow binding").into_response();
        }
    };
    let Some(url) = binding.webhook_url.as_deref().filter(|url| !url.trim().is_empty()) else {
        return JsonResponse::bad_request("No webhook URL registered for this product")
            .into_response();
    };

    let data = if request.data.is_null() {
        json!({})
    } else {
        request.data
    };
    match webhook::send_command(
        &state.http_client,
        url,
        state.config.webhook_signing_secret.as_deref(),
        product_id,
        request.command,
        &data,
    )
    .await
    {
        Ok(status) => Json(json!({
            "success": true,
            "command": request.command,
            "status": status.as_u16(),
        }))
        .into_response(),
        Err(err @ WebhookError::InvalidUrl(_)) => {
            JsonResponse::bad_request(&err.to_string()).into_response()
        }
        Err(err @ WebhookError::Status(_)) => {
            JsonResponse::bad_gateway(&err.to_string(), "webhook_rejected").into_response()
        }
        Err(err @ WebhookError::Http(_)) => {
            JsonResponse::bad_gateway(&err.to_string(), "webhook_unreachable").into_response()
        }
        Err(err @ WebhookError::Encode(_)) => {
            error!(%product_id, error = %err, "webhook payload encoding failed");
            JsonResponse::server_error(&err.to_string()).into_response()
        }
    }
}
