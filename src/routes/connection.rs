use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::engine_error_response;
use crate::state::AppState;

const DEFAULT_WORKFLOW_LIMIT: u32 = 50;
const MAX_WORKFLOW_LIMIT: u32 = 250;

pub async fn test_connection(State(state): State<AppState>) -> Response {
    match state.engine.test_connection().await {
        Ok(()) => Json(json!({ "success": true, "connected": true })).into_response(),
        Err(err) => engine_error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsQuery {
    pub limit: Option<u32>,
}

pub async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListWorkflowsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_WORKFLOW_LIMIT)
        .clamp(1, MAX_WORKFLOW_LIMIT);
    match state.engine.list_workflows(limit).await {
        Ok(workflows) => Json(json!({ "success": true, "workflows": workflows })).into_response(),
        Err(err) => engine_error_response(&err),
    }
}
