use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use super::extraction::UsageExtractor;
use super::rollup;
use crate::db::daily_usage_repository::DailyUsageRepository;
use crate::models::usage::{CalendarUsage, ExecutionUsage, LiveUsage, UsageReport};
use crate::models::workflow::ExecutionSummary;
use crate::services::engine::EngineClient;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("invalid workflow id: {0}")]
    Validation(String),
    #[error("daily usage counters unavailable: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorSettings {
    /// Executions listed per poll (N).
    pub execution_limit: u32,
    /// Terminal executions fetched in detail (K).
    pub detail_limit: usize,
    /// Concurrent detail fetches per batch.
    pub batch_size: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            execution_limit: 50,
            detail_limit: 20,
            batch_size: 5,
        }
    }
}

/// Calendar window for the durable rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindow {
    pub today: NaiveDate,
    pub days: u32,
}

impl UsageWindow {
    pub const DEFAULT_DAYS: u32 = 30;

    pub fn at(tz: Tz, now: DateTime<Utc>) -> Self {
        Self {
            today: rollup::local_today(tz, now),
            days: Self::DEFAULT_DAYS,
        }
    }
}

#[derive(Clone)]
pub struct UsageAggregator {
    engine: EngineClient,
    daily: Arc<dyn DailyUsageRepository>,
    extractor: Arc<UsageExtractor>,
    settings: AggregatorSettings,
}

impl UsageAggregator {
    pub fn new(
        engine: EngineClient,
        daily: Arc<dyn DailyUsageRepository>,
        extractor: UsageExtractor,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            engine,
            daily,
            extractor: Arc::new(extractor),
            settings,
        }
    }

    pub fn settings(&self) -> AggregatorSettings {
        self.settings
    }

    /// Live figures degrade per execution and never fail the report; only
    /// an invalid id or an unreadable counter table does.
    pub async fn load_usage(
        &self,
        workflow_id: &str,
        window: UsageWindow,
    ) -> Result<UsageReport, AggregationError> {
        let workflow_id = workflow_id.trim();
        if workflow_id.is_empty() {
            return Err(AggregationError::Validation(
                "workflow id must not be empty".into(),
            ));
        }

        let (live, calendar) = tokio::join!(
            self.live_usage(workflow_id),
            self.calendar_usage(workflow_id, window)
        );

        Ok(UsageReport {
            workflow_id: workflow_id.to_string(),
            live,
            calendar: calendar?,
            generated_at: Utc::now(),
        })
    }

    pub async fn calendar_usage(
        &self,
        workflow_id: &str,
        window: UsageWindow,
    ) -> Result<CalendarUsage, AggregationError> {
        let from = rollup::query_start(window.today, window.days);
        let records = self
            .daily
            .list_range(workflow_id, from, window.today)
            .await?;
        Ok(rollup::rollup(&records, window.today, window.days))
    }

    pub async fn live_usage(&self, workflow_id: &str) -> LiveUsage {
        let summaries = match self
            .engine
            .get_executions(workflow_id, self.settings.execution_limit)
            .await
        {
            Ok(summaries) => summaries,
            Err(err) => {
                warn!(workflow_id, error = %err, "could not list executions");
                return LiveUsage::unavailable(err.to_string());
            }
        };

        // Running executions have incomplete usage by definition.
        let mut terminal: Vec<ExecutionSummary> = summaries
            .into_iter()
            .filter(|s| s.status.is_terminal())
            .collect();
        terminal.sort_by(|a, b| {
            by_recency(a.started_at, &a.execution_id, b.started_at, &b.execution_id)
        });
        let terminal_in_window = terminal.len();
        terminal.truncate(self.settings.detail_limit);

        let mut rows = Vec::with_capacity(terminal.len());
        for batch in terminal.chunks(self.settings.batch_size.max(1)) {
            let results = join_all(batch.iter().map(|summary| self.execution_usage(summary))).await;
            rows.extend(results);
        }

        // Completion order is irrelevant; order only after every batch is in.
        rows.sort_by(|a, b| {
            by_recency(a.started_at, &a.execution_id, b.started_at, &b.execution_id)
        });

        let mut live = LiveUsage {
            execution_count: rows.len(),
            terminal_executions_in_window: terminal_in_window,
            ..Default::default()
        };
        for row in &rows {
            match &row.usage {
                Some(usage) => {
                    live.total_tokens = live.total_tokens.saturating_add(usage.total_tokens);
                    live.prompt_tokens = live.prompt_tokens.saturating_add(usage.prompt_tokens);
                    live.completion_tokens =
                        live.completion_tokens.saturating_add(usage.completion_tokens);
                }
                None => live.failed_executions += 1,
            }
        }
        live.partial = live.failed_executions > 0;
        live.by_execution = rows;
        debug!(
            workflow_id,
            executions = live.execution_count,
            failed = live.failed_executions,
            total_tokens = live.total_tokens,
            "live usage aggregated"
        );
        live
    }

    async fn execution_usage(&self, summary: &ExecutionSummary) -> ExecutionUsage {
        let (usage, error) = match self.engine.get_execution(&summary.execution_id).await {
            Ok(payload) => (Some(self.extractor.extract(&payload)), None),
            Err(err) => {
                warn!(
                    workflow_id = %summary.workflow_id,
                    execution_id = %summary.execution_id,
                    error = %err,
                    "execution detail unavailable, usage unknown"
                );
                (None, Some(err.to_string()))
            }
        };
        ExecutionUsage {
            execution_id: summary.execution_id.clone(),
            workflow_id: summary.workflow_id.clone(),
            status: summary.status,
            started_at: summary.started_at,
            stopped_at: summary.stopped_at,
            usage,
            error,
        }
    }
}

/// Newest first; equal start times fall back to the id, descending.
fn by_recency(
    a_started: DateTime<Utc>,
    a_id: &str,
    b_started: DateTime<Utc>,
    b_id: &str,
) -> Ordering {
    b_started.cmp(&a_started).then_with(|| b_id.cmp(a_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_db::InMemoryDailyUsageRepository;
    use crate::models::usage::DailyUsageRecord;
    use crate::models::workflow::ExecutionStatus;
    use crate::services::engine::mock::MockRelay;
    use crate::services::engine::{EngineAction, EngineError};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn execution_payload(node: &str, prompt: u64, completion: u64) -> Value {
        let items = if prompt + completion == 0 {
            json!([[{"json": {"text": "no llm"}}]])
        } else {
            json!([[{"json": {"tokenUsage": {"promptTokens": prompt, "completionTokens": completion}}}]])
        };
        json!({
            "success": true,
            "execution": {
                "data": {"resultData": {"runData": {node: [{"data": {"main": items}}]}}}
            }
        })
    }

    fn listing(entries: &[(&str, &str, &str)]) -> Value {
        let executions: Vec<Value> = entries
            .iter()
            .map(|(id, status, started)| json!({"id": id, "status": status, "startedAt": started}))
            .collect();
        json!({"success": true, "executions": executions})
    }

    fn aggregator(relay: MockRelay, daily: InMemoryDailyUsageRepository) -> UsageAggregator {
        UsageAggregator::new(
            EngineClient::new(Arc::new(relay)),
            Arc::new(daily),
            UsageExtractor::default(),
            AggregatorSettings::default(),
        )
    }

    fn window() -> UsageWindow {
        UsageWindow {
            today: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            days: 7,
        }
    }

    #[tokio::test]
    async fn aggregates_terminal_executions_and_skips_running() {
        let relay = MockRelay::new(|action, params| match action {
            EngineAction::GetExecutions => Ok(listing(&[
                ("1", "success", "2024-06-01T10:00:00Z"),
                ("2", "success", "2024-06-01T11:00:00Z"),
                ("3", "error", "2024-06-01T12:00:00Z"),
                ("4", "running", "2024-06-01T13:00:00Z"),
            ])),
            EngineAction::GetExecution => match params["executionId"].as_str() {
                Some("1") => Ok(execution_payload("A", 120, 30)),
                Some("2") => Ok(execution_payload("B", 0, 0)),
                Some("3") => Ok(execution_payload("C", 50, 10)),
                _ => Ok(json!({"success": false, "error": "not found"})),
            },
            _ => Ok(json!({"success": false, "error": "unexpected"})),
        });
        let agg = aggregator(relay.clone(), InMemoryDailyUsageRepository::default());

        let report = agg.load_usage("wf-42", window()).await.unwrap();

        assert_eq!(report.live.total_tokens, 210);
        assert_eq!(report.live.execution_count, 3);
        assert_eq!(report.live.terminal_executions_in_window, 3);
        assert!(!report.live.partial);
        assert_eq!(relay.count(EngineAction::GetExecution), 3);
        let ids: Vec<&str> = report
            .live
            .by_execution
            .iter()
            .map(|e| e.execution_id.as_str())
            .collect();
        assert_eq!(ids, vec!["3", "2", "1"]);
        let b = &report.live.by_execution[1];
        assert!(b.usage.as_ref().unwrap().node_breakdown.is_empty());
    }

    #[tokio::test]
    async fn ordering_ignores_fetch_completion_order() {
        // Older executions resolve first; newer ones are slowest.
        let relay = MockRelay::new(|action, _| match action {
            EngineAction::GetExecutions => Ok(listing(&[
                ("10", "success", "2024-06-01T10:00:00Z"),
                ("11", "success", "2024-06-01T10:01:00Z"),
                ("12", "success", "2024-06-01T10:02:00Z"),
                ("13", "success", "2024-06-01T10:03:00Z"),
                ("14", "success", "2024-06-01T10:04:00Z"),
                ("15", "success", "2024-06-01T10:05:00Z"),
            ])),
            EngineAction::GetExecution => Ok(execution_payload("Agent", 1, 1)),
            _ => Ok(json!({"success": false})),
        })
        .with_delay(|action, params| {
            if action != EngineAction::GetExecution {
                return Duration::ZERO;
            }
            let id: u64 = params["executionId"].as_str().unwrap().parse().unwrap();
            Duration::from_millis((id - 9) * 10)
        });
        let agg = aggregator(relay, InMemoryDailyUsageRepository::default());

        let live = agg.live_usage("wf-42").await;

        let ids: Vec<&str> = live
            .by_execution
            .iter()
            .map(|e| e.execution_id.as_str())
            .collect();
        assert_eq!(ids, vec!["15", "14", "13", "12", "11", "10"]);
        for pair in live.by_execution.windows(2) {
            assert!(pair[0].started_at >= pair[1].started_at);
        }
        assert_eq!(live.total_tokens, 12);
    }

    #[tokio::test]
    async fn failed_detail_fetch_marks_row_unknown() {
        let relay = MockRelay::new(|action, params| match action {
            EngineAction::GetExecutions => Ok(listing(&[
                ("1", "success", "2024-06-01T10:05:00Z"),
                ("2", "success", "2024-06-01T10:04:00Z"),
                ("3", "success", "2024-06-01T10:03:00Z"),
                ("4", "success", "2024-06-01T10:02:00Z"),
                ("5", "success", "2024-06-01T10:01:00Z"),
            ])),
            EngineAction::GetExecution if params["executionId"] == "3" => {
                Err(EngineError::Connection("timed out".into()))
            }
            EngineAction::GetExecution => Ok(execution_payload("Agent", 10, 5)),
            _ => Ok(json!({"success": false})),
        });
        let agg = aggregator(relay, InMemoryDailyUsageRepository::default());

        let live = agg.live_usage("wf-42").await;

        assert_eq!(live.by_execution.len(), 5);
        assert_eq!(live.failed_executions, 1);
        assert!(live.partial);
        assert_eq!(live.total_tokens, 60);
        let third = &live.by_execution[2];
        assert_eq!(third.execution_id, "3");
        assert!(third.usage_unknown());
        assert!(third.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(third.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn detail_fetches_are_capped_at_k() {
        let relay = MockRelay::new(|action, _| match action {
            EngineAction::GetExecutions => {
                let executions: Vec<Value> = (0..30)
                    .map(|i| {
                        json!({
                            "id": format!("{i}"),
                            "status": "success",
                            "startedAt": format!("2024-06-01T10:{i:02}:00Z")
                        })
                    })
                    .collect();
                Ok(json!({"success": true, "executions": executions}))
            }
            EngineAction::GetExecution => Ok(execution_payload("Agent", 1, 0)),
            _ => Ok(json!({"success": false})),
        });
        let agg = aggregator(relay.clone(), InMemoryDailyUsageRepository::default());

        let live = agg.live_usage("wf-42").await;

        assert_eq!(relay.count(EngineAction::GetExecution), 20);
        assert_eq!(live.execution_count, 20);
        assert_eq!(live.terminal_executions_in_window, 30);
        assert_eq!(live.by_execution[0].execution_id, "29");
        let listed = &relay.calls()[0];
        assert_eq!(listed.1["limit"], 50);
    }

    #[tokio::test]
    async fn listing_failure_keeps_calendar_figures() {
        let relay = MockRelay::new(|_, _| Err(EngineError::Connection("relay down".into())));
        let daily = InMemoryDailyUsageRepository::with_records(vec![DailyUsageRecord {
            workflow_id: "wf-42".into(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            tokens_used: 500,
            requests_count: 3,
        }]);
        let agg = aggregator(relay, daily);

        let report = agg.load_usage("wf-42", window()).await.unwrap();

        assert!(report.live.partial);
        assert!(report.live.error.is_some());
        assert!(report.live.by_execution.is_empty());
        assert_eq!(report.calendar.today.tokens, 500);
        assert_eq!(report.calendar.daily_data.last().unwrap().tokens, 500);
    }

    #[tokio::test]
    async fn rejects_blank_workflow_id_before_any_call() {
        let relay = MockRelay::new(|_, _| Ok(json!({"success": true, "executions": []})));
        let agg = aggregator(relay.clone(), InMemoryDailyUsageRepository::default());

        let err = agg.load_usage("  ", window()).await.unwrap_err();

        assert!(matches!(err, AggregationError::Validation(_)));
        assert!(relay.calls().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_is_reported() {
        let relay = MockRelay::new(|_, _| Ok(json!({"success": true, "executions": []})));
        let daily = InMemoryDailyUsageRepository {
            should_fail: true,
            ..Default::default()
        };
        let agg = aggregator(relay, daily);

        assert!(matches!(
            agg.load_usage("wf-42", window()).await,
            Err(AggregationError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn oversized_execution_totals_saturate() {
        let relay = MockRelay::new(|action, _| match action {
            EngineAction::GetExecutions => Ok(listing(&[
                ("1", "success", "2024-06-01T10:00:00Z"),
                ("2", "success", "2024-06-01T11:00:00Z"),
            ])),
            EngineAction::GetExecution => Ok(execution_payload("A", u64::MAX, 0)),
            _ => Ok(json!({"success": false, "error": "unexpected"})),
        });
        let agg = aggregator(relay, InMemoryDailyUsageRepository::default());

        let report = agg.load_usage("wf-42", window()).await.unwrap();

        assert_eq!(report.live.total_tokens, u64::MAX);
        assert_eq!(report.live.prompt_tokens, u64::MAX);
        assert_eq!(report.live.execution_count, 2);
        assert!(!report.live.partial);
    }
}
