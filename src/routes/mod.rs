pub mod activation;
pub mod agents;
pub mod commands;
pub mod connection;
pub mod relay;
pub mod usage;

use axum::{
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tracing::error;

use crate::responses::JsonResponse;
use crate::services::engine::EngineError;
use crate::state::AppState;
use crate::utils::auth::require_admin_token;

/// Admin console API plus the relay endpoint. Cross-cutting layers (rate
/// limiting, CORS, tracing) are added by the binary.
pub fn app(state: AppState) -> Router {
    let agent_routes = Router::new()
        .route("/connection", get(connection::test_connection))
        .route("/workflows", get(connection::list_workflows))
        .route(
            "/workflows/{workflow_id}/activation",
            get(activation::get_activation),
        )
        .route(
            "/workflows/{workflow_id}/activate",
            post(activation::activate_workflow),
        )
        .route(
            "/workflows/{workflow_id}/deactivate",
            post(activation::deactivate_workflow),
        )
        .route("/workflows/{workflow_id}/usage", get(usage::get_usage))
        .route(
            "/workflows/{workflow_id}/usage/stream",
            get(usage::stream_usage),
        )
        .route(
            "/{product_id}/config",
            get(agents::get_config).put(agents::put_config),
        )
        .route("/{product_id}/config/sync", post(agents::sync_config))
        .route("/{product_id}/commands", post(commands::send_command))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    Router::new()
        .nest("/api/agents", agent_routes)
        .route("/api/relay", post(relay::handle_relay))
        .with_state(state)
}

/// Maps engine failures onto the API envelope. Credential failures need an
/// operator, so they are reported as server errors rather than upstream ones.
pub(crate) fn engine_error_response(err: &EngineError) -> Response {
    match err {
        EngineError::Connection(msg) => {
            JsonResponse::service_unavailable(msg, "connection_error").into_response()
        }
        EngineError::Action { message, .. } => {
            JsonResponse::bad_gateway(message, "action_error").into_response()
        }
        EngineError::Auth(msg) => {
            error!(error = %msg, "workflow engine credentials rejected");
            JsonResponse::server_error_with_code(
                "Workflow engine credentials were rejected; operator action required",
                "auth_error",
            )
            .into_response()
        }
        EngineError::InvalidResponse(msg) => {
            JsonResponse::bad_gateway(msg, "invalid_response").into_response()
        }
    }
}
