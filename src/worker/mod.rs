use std::sync::Arc;

use tracing::{info, warn};

use crate::state::AppState;

pub mod usage_poller;

pub use usage_poller::{PollScheduler, PollingRegistry, UsageSnapshot, UsageSource};

/// Starts usage polling for every workflow currently marked active so the
/// first dashboard request already has a snapshot.
pub async fn start_background_workers(state: AppState) {
    let bindings = match state.bindings.list_bindings().await {
        Ok(bindings) => bindings,
        Err(err) => {
            warn!(error = %err, "could not list workflow bindings, polling starts on demand");
            return;
        }
    };

    let mut started = 0usize;
    for binding in bindings.iter().filter(|b| b.is_active) {
        let scheduler: Arc<PollScheduler> = state.pollers.get_or_start(&binding.workflow_id);
        tokio::spawn(async move {
            scheduler.refresh_now().await;
        });
        started += 1;
    }
    info!(started, "usage polling started");
}
