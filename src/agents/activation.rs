use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::workflow_binding_repository::WorkflowBindingRepository;
use crate::models::activation::{ActivationState, ActivationStatus};
use crate::models::workflow_binding::WorkflowBinding;
use crate::services::engine::{EngineClient, EngineError};

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("activation flag could not be stored: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Cached state plus a counter bumped whenever a toggle starts or finishes.
/// A poll only lands if no toggle moved the counter while it was reading.
#[derive(Debug, Clone)]
struct Tracked {
    state: ActivationState,
    generation: u64,
}

/// Tracks local and remote activation per workflow. Displayed state is
/// always re-derived from the latest remote read; a toggle only moves the
/// workflow to `transitioning` until the next successful poll.
#[derive(Clone)]
pub struct ActivationReconciler {
    engine: EngineClient,
    bindings: Arc<dyn WorkflowBindingRepository>,
    states: Arc<DashMap<String, Tracked>>,
}

impl ActivationReconciler {
    pub fn new(engine: EngineClient, bindings: Arc<dyn WorkflowBindingRepository>) -> Self {
        Self {
            engine,
            bindings,
            states: Arc::new(DashMap::new()),
        }
    }

    async fn require_binding(&self, workflow_id: &str) -> Result<WorkflowBinding, ActivationError> {
        let workflow_id = workflow_id.trim();
        if workflow_id.is_empty() {
            return Err(ActivationError::Validation(
                "workflow id must not be empty".into(),
            ));
        }
        self.bindings
            .find_binding(workflow_id)
            .await?
            .ok_or_else(|| ActivationError::Validation(format!("unknown workflow {workflow_id}")))
    }

    fn initial(binding: &WorkflowBinding) -> ActivationState {
        let mut state = ActivationState::unknown(&binding.workflow_id, binding.is_active);
        state.last_reconciled_at = binding.last_reconciled_at;
        state
    }

    fn current(&self, binding: &WorkflowBinding) -> ActivationState {
        match self.states.get(&binding.workflow_id) {
            Some(tracked) => tracked.state.clone(),
            None => Self::initial(binding),
        }
    }

    fn generation(&self, workflow_id: &str) -> u64 {
        self.states
            .get(workflow_id)
            .map(|tracked| tracked.generation)
            .unwrap_or(0)
    }

    /// Stores a toggle-driven state and invalidates polls already running.
    fn store_toggled(&self, workflow_id: &str, state: ActivationState) {
        let mut entry = self.states.entry(workflow_id.to_string()).or_insert(Tracked {
            state: state.clone(),
            generation: 0,
        });
        entry.state = state;
        entry.generation += 1;
    }

    /// Last known state without touching the engine.
    pub async fn state(&self, workflow_id: &str) -> Result<ActivationState, ActivationError> {
        let binding = self.require_binding(workflow_id).await?;
        let mut state = self.current(&binding);
        state.local_is_active = binding.is_active;
        Ok(state)
    }

    /// Reads the remote state and settles the workflow on `online` or
    /// `offline`. A failed read leaves the previous state untouched, and a
    /// read overtaken by a toggle is discarded.
    pub async fn poll(&self, workflow_id: &str) -> Result<ActivationState, ActivationError> {
        let binding = self.require_binding(workflow_id).await?;
        let generation = self.generation(&binding.workflow_id);
        let remote = self.engine.get_workflow(&binding.workflow_id).await?;

        // The local flag may have moved while the engine was being read.
        let local_is_active = match self.bindings.find_binding(&binding.workflow_id).await {
            Ok(Some(fresh)) => fresh.is_active,
            Ok(None) => binding.is_active,
            Err(err) => {
                warn!(workflow_id = %binding.workflow_id, error = %err, "could not re-read local activation flag");
                binding.is_active
            }
        };

        let now = Utc::now();
        let state = ActivationState {
            workflow_id: binding.workflow_id.clone(),
            local_is_active,
            remote_is_active: Some(remote.active),
            status: if remote.active {
                ActivationStatus::Online
            } else {
                ActivationStatus::Offline
            },
            last_reconciled_at: Some(now),
        };

        {
            let mut entry = self
                .states
                .entry(binding.workflow_id.clone())
                .or_insert_with(|| Tracked {
                    state: Self::initial(&binding),
                    generation: 0,
                });
            if entry.generation != generation {
                debug!(workflow_id = %binding.workflow_id, "toggle started during poll, discarding remote read");
                return Ok(entry.state.clone());
            }
            entry.state = state.clone();
        }

        if state.drift() {
            warn!(
                workflow_id = %state.workflow_id,
                local = state.local_is_active,
                remote = remote.active,
                "activation drift between local flag and engine"
            );
        }
        if let Err(err) = self.bindings.mark_reconciled(&binding.workflow_id, now).await {
            warn!(workflow_id = %binding.workflow_id, error = %err, "failed to record reconciliation time");
        }
        Ok(state)
    }

    pub async fn activate(&self, workflow_id: &str) -> Result<ActivationState, ActivationError> {
        self.toggle(workflow_id, true).await
    }

    pub async fn deactivate(&self, workflow_id: &str) -> Result<ActivationState, ActivationError> {
        self.toggle(workflow_id, false).await
    }

    async fn toggle(&self, workflow_id: &str, active: bool) -> Result<ActivationState, ActivationError> {
        let binding = self.require_binding(workflow_id).await?;
        let previous = self.current(&binding);

        let mut pending = previous.clone();
        pending.status = ActivationStatus::Transitioning;
        self.store_toggled(&binding.workflow_id, pending.clone());

        let result = if active {
            self.engine.activate_workflow(&binding.workflow_id).await
        } else {
            self.engine.deactivate_workflow(&binding.workflow_id).await
        };
        if let Err(err) = result {
            self.store_toggled(&binding.workflow_id, previous);
            return Err(err.into());
        }
        self.store_toggled(&binding.workflow_id, pending.clone());

        // The engine accepted the toggle; the local flag follows, and the
        // state stays transitioning until a poll confirms it.
        self.bindings
            .set_local_active(&binding.workflow_id, active)
            .await
            .inspect_err(|err| {
                warn!(workflow_id = %binding.workflow_id, error = %err, "engine toggled but local flag was not stored")
            })?;
        pending.local_is_active = active;
        if let Some(mut tracked) = self.states.get_mut(&binding.workflow_id) {
            tracked.state = pending.clone();
        }
        info!(workflow_id = %binding.workflow_id, active, "activation toggle accepted");
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_db::InMemoryWorkflowBindingRepository;
    use crate::db::workflow_binding_repository::MockWorkflowBindingRepository;
    use crate::services::engine::mock::MockRelay;
    use crate::services::engine::EngineAction;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn reconciler(
        relay: MockRelay,
        repo: Arc<InMemoryWorkflowBindingRepository>,
    ) -> ActivationReconciler {
        ActivationReconciler::new(EngineClient::new(Arc::new(relay)), repo)
    }

    fn repo(active: bool) -> Arc<InMemoryWorkflowBindingRepository> {
        Arc::new(InMemoryWorkflowBindingRepository::with_binding(
            InMemoryWorkflowBindingRepository::binding("wf-42", Uuid::new_v4(), active),
        ))
    }

    fn workflow_body(active: bool) -> serde_json::Value {
        json!({"success": true, "workflow": {"id": "wf-42", "name": "Agent", "active": active}})
    }

    #[tokio::test]
    async fn starts_unknown_until_first_poll() {
        let relay = MockRelay::new(|_, _| Ok(workflow_body(true)));
        let rec = reconciler(relay.clone(), repo(true));

        let state = rec.state("wf-42").await.unwrap();
        assert_eq!(state.status, ActivationStatus::Unknown);
        assert!(relay.calls().is_empty());

        let polled = rec.poll("wf-42").await.unwrap();
        assert_eq!(polled.status, ActivationStatus::Online);
        assert_eq!(polled.remote_is_active, Some(true));
        assert!(polled.last_reconciled_at.is_some());
    }

    #[tokio::test]
    async fn toggle_waits_for_poll_ground_truth() {
        // The engine accepts the activation but still reports inactive.
        let relay = MockRelay::new(|action, _| match action {
            EngineAction::ActivateWorkflow => Ok(json!({"success": true})),
            EngineAction::GetWorkflow => Ok(workflow_body(false)),
            _ => Ok(json!({"success": false})),
        });
        let bindings = repo(false);
        let rec = reconciler(relay, bindings.clone());

        let toggled = rec.activate("wf-42").await.unwrap();
        assert_eq!(toggled.status, ActivationStatus::Transitioning);
        assert!(toggled.local_is_active);
        assert_eq!(bindings.local_flag("wf-42"), Some(true));

        let polled = rec.poll("wf-42").await.unwrap();
        assert_eq!(polled.status, ActivationStatus::Offline);
        assert_eq!(polled.remote_is_active, Some(false));
        assert!(polled.drift());
    }

    #[tokio::test]
    async fn unknown_workflow_is_rejected_before_network() {
        let relay = MockRelay::new(|_, _| Ok(json!({"success": true})));
        let rec = reconciler(relay.clone(), repo(true));

        assert!(matches!(
            rec.activate("wf-missing").await,
            Err(ActivationError::Validation(_))
        ));
        assert!(matches!(
            rec.deactivate("").await,
            Err(ActivationError::Validation(_))
        ));
        assert!(relay.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_toggle_restores_previous_state() {
        let relay = MockRelay::new(|action, _| match action {
            EngineAction::GetWorkflow => Ok(workflow_body(true)),
            _ => Ok(json!({"success": false, "error": "workflow has no trigger node"})),
        });
        let bindings = repo(true);
        let rec = reconciler(relay, bindings.clone());
        rec.poll("wf-42").await.unwrap();

        let err = rec.deactivate("wf-42").await.unwrap_err();

        assert!(matches!(err, ActivationError::Engine(EngineError::Action { .. })));
        let state = rec.state("wf-42").await.unwrap();
        assert_eq!(state.status, ActivationStatus::Online);
        assert_eq!(bindings.local_flag("wf-42"), Some(true));
    }

    #[tokio::test]
    async fn failed_poll_keeps_last_known_state() {
        let fail = Arc::new(AtomicBool::new(false));
        let flag = fail.clone();
        let relay = MockRelay::new(move |_, _| {
            if flag.load(Ordering::SeqCst) {
                Err(EngineError::Connection("unreachable".into()))
            } else {
                Ok(workflow_body(true))
            }
        });
        let rec = reconciler(relay, repo(true));
        let first = rec.poll("wf-42").await.unwrap();

        fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            rec.poll("wf-42").await,
            Err(ActivationError::Engine(EngineError::Connection(_)))
        ));
        let state = rec.state("wf-42").await.unwrap();
        assert_eq!(state.status, ActivationStatus::Online);
        assert_eq!(state.last_reconciled_at, first.last_reconciled_at);
    }

    #[tokio::test]
    async fn remote_success_with_local_write_failure_is_surfaced() {
        let mut bindings = MockWorkflowBindingRepository::new();
        bindings.expect_find_binding().returning(|id| {
            Ok(Some(InMemoryWorkflowBindingRepository::binding(
                id,
                Uuid::nil(),
                false,
            )))
        });
        bindings
            .expect_set_local_active()
            .withf(|id, active| id.to_string() == "wf-42" && *active)
            .times(1)
            .returning(|_, _| Err(sqlx::Error::PoolTimedOut));
        let relay = MockRelay::new(|_, _| Ok(json!({"success": true})));
        let rec = ActivationReconciler::new(EngineClient::new(Arc::new(relay)), Arc::new(bindings));

        let err = rec.activate("wf-42").await.unwrap_err();

        assert!(matches!(err, ActivationError::Storage(_)));
        let state = rec.state("wf-42").await.unwrap();
        assert_eq!(state.status, ActivationStatus::Transitioning);
    }

    #[tokio::test]
    async fn poll_started_before_toggle_does_not_end_transition() {
        let remote_active = Arc::new(AtomicBool::new(false));
        let remote = remote_active.clone();
        let relay = MockRelay::new(move |action, _| match action {
            EngineAction::ActivateWorkflow => {
                remote.store(true, Ordering::SeqCst);
                Ok(json!({"success": true}))
            }
            EngineAction::GetWorkflow => Ok(workflow_body(remote.load(Ordering::SeqCst))),
            _ => Ok(json!({"success": false})),
        })
        .with_delay(|action, _| match action {
            EngineAction::GetWorkflow => Duration::from_millis(100),
            _ => Duration::ZERO,
        });
        let bindings = repo(false);
        let rec = reconciler(relay, bindings.clone());

        let slow_poll = {
            let rec = rec.clone();
            tokio::spawn(async move { rec.poll("wf-42").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let toggled = rec.activate("wf-42").await.unwrap();
        assert_eq!(toggled.status, ActivationStatus::Transitioning);

        let stale = slow_poll.await.unwrap().unwrap();
        assert_eq!(stale.status, ActivationStatus::Transitioning);
        let cached = rec.state("wf-42").await.unwrap();
        assert_eq!(cached.status, ActivationStatus::Transitioning);
        assert!(cached.local_is_active);
        assert_eq!(cached.remote_is_active, None);

        let settled = rec.poll("wf-42").await.unwrap();
        assert_eq!(settled.status, ActivationStatus::Online);
        assert!(settled.local_is_active);
        assert!(!settled.drift());
        assert!(remote_active.load(Ordering::SeqCst));
    }
}
