use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::{error, warn};

use crate::responses::JsonResponse;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub refresh: bool,
}

async fn require_bound(state: &AppState, workflow_id: &str) -> Result<(), Response> {
    match state.bindings.find_binding(workflow_id.trim()).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(JsonResponse::not_found("Unknown workflow").into_response()),
        Err(err) => {
            error!(workflow_id, error = %err, "binding lookup failed");
            Err(JsonResponse::server_error("Failed to load workflow binding").into_response())
        }
    }
}

/// Latest usage snapshot for a workflow. The first request, or any request
/// with `refresh=true`, polls immediately instead of waiting for the timer.
pub async fn get_usage(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Response {
    if let Err(resp) = require_bound(&state, &workflow_id).await {
        return resp;
    }
    let poller = state.pollers.get_or_start(workflow_id.trim());

    let snapshot = match poller.latest() {
        Some(snapshot) if !query.refresh => Some(snapshot),
        _ => poller.refresh_now().await,
    };
    let Some(snapshot) = snapshot else {
        let reason = poller
            .last_error()
            .unwrap_or_else(|| "Usage is not available yet".to_string());
        return JsonResponse::service_unavailable(&reason, "usage_unavailable").into_response();
    };

    Json(json!({
        "success": true,
        "stale": poller.is_stale(Utc::now()),
        "inFlight": poller.in_flight(),
        "lastError": poller.last_error(),
        "snapshot": snapshot.as_ref(),
    }))
    .into_response()
}

/// Pushes every newly published snapshot as a `usage` event.
pub async fn stream_usage(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Response {
    if let Err(resp) = require_bound(&state, &workflow_id).await {
        return resp;
    }
    let rx = state.pollers.get_or_start(workflow_id.trim()).subscribe();

    // The watch stream yields the current snapshot first, then each change.
    let s = WatchStream::new(rx).filter_map(move |snapshot| {
        let snapshot = snapshot?;
        match Event::default().event("usage").json_data(snapshot.as_ref()) {
            Ok(ev) => Some(Ok::<Event, Infallible>(ev)),
            Err(err) => {
                warn!(%workflow_id, error = %err, "failed to encode usage event");
                None
            }
        }
    });

    Sse::new(s)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(10))
                .text("keepalive"),
        )
        .into_response()
}
