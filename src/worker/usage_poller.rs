//! Interval polling of usage reports, one scheduler per workflow.
//!
//! Each poll is tagged with a sequence number taken from a monotonic counter.
//! A result is published only if nothing newer has been published yet, so a
//! slow poll overtaken by a manual refresh cannot overwrite fresher data.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::models::usage::UsageReport;
use crate::usage::{AggregationError, UsageAggregator, UsageWindow};

#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn fetch(&self, workflow_id: &str) -> Result<UsageReport, AggregationError>;
}

/// Loads reports through the aggregator for the current local date.
pub struct AggregatorSource {
    pub aggregator: UsageAggregator,
    pub timezone: Tz,
}

#[async_trait]
impl UsageSource for AggregatorSource {
    async fn fetch(&self, workflow_id: &str) -> Result<UsageReport, AggregationError> {
        let window = UsageWindow::at(self.timezone, Utc::now());
        self.aggregator.load_usage(workflow_id, window).await
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub sequence: u64,
    pub report: UsageReport,
    pub fetched_at: DateTime<Utc>,
}

struct PollState {
    workflow_id: String,
    source: Arc<dyn UsageSource>,
    interval: Duration,
    issued: AtomicU64,
    in_flight: AtomicUsize,
    snapshots: watch::Sender<Option<Arc<UsageSnapshot>>>,
    last_error: Mutex<Option<String>>,
}

/// Holds one slot of the in-flight count and releases it on drop, so a
/// cancelled or panicking poll cannot leave the count raised.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        InFlight(count)
    }

    /// Claims the slot only when nothing else is running.
    fn claim_idle(count: &'a AtomicUsize) -> Option<Self> {
        count
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlight(count))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PollState {
    async fn poll(&self, sequence: u64, slot: InFlight<'_>) {
        let result = self.source.fetch(&self.workflow_id).await;
        drop(slot);

        let report = match result {
            Ok(report) => report,
            Err(err) => {
                warn!(workflow_id = %self.workflow_id, sequence, error = %err, "usage poll failed");
                if let Ok(mut last) = self.last_error.lock() {
                    *last = Some(err.to_string());
                }
                return;
            }
        };

        let published = self.snapshots.send_if_modified(|current| {
            if current.as_ref().is_some_and(|s| s.sequence >= sequence) {
                return false;
            }
            *current = Some(Arc::new(UsageSnapshot {
                sequence,
                report,
                fetched_at: Utc::now(),
            }));
            true
        });
        if published {
            if let Ok(mut last) = self.last_error.lock() {
                *last = None;
            }
            debug!(workflow_id = %self.workflow_id, sequence, "usage snapshot published");
        } else {
            debug!(workflow_id = %self.workflow_id, sequence, "dropping superseded usage poll");
        }
    }

    async fn refresh(&self) {
        let slot = InFlight::enter(&self.in_flight);
        let sequence = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.poll(sequence, slot).await;
    }

    /// Timer-driven poll; skipped while any poll is still running.
    async fn tick(&self) {
        let Some(slot) = InFlight::claim_idle(&self.in_flight) else {
            debug!(workflow_id = %self.workflow_id, "poll still in flight, skipping tick");
            return;
        };
        let sequence = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.poll(sequence, slot).await;
    }
}

pub struct PollScheduler {
    state: Arc<PollState>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl PollScheduler {
    pub fn new(workflow_id: &str, source: Arc<dyn UsageSource>, interval: Duration) -> Self {
        let (snapshots, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(PollState {
                workflow_id: workflow_id.to_string(),
                source,
                interval: interval.max(Duration::from_millis(1)),
                issued: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                snapshots,
                last_error: Mutex::new(None),
            }),
            ticker: Mutex::new(None),
            shutdown,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.state.workflow_id
    }

    pub fn interval(&self) -> Duration {
        self.state.interval
    }

    /// Spawns the ticking task. Calling it again while running is a no-op.
    pub fn start(&self) {
        let Ok(mut ticker) = self.ticker.lock() else {
            return;
        };
        if ticker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let _ = self.shutdown.send(false);

        let state = self.state.clone();
        let mut shutdown = self.shutdown.subscribe();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // Polled inside the ticker so stopping also cancels it.
                        tokio::select! {
                            _ = state.tick() => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!(workflow_id = %state.workflow_id, "usage poller stopped");
        }));
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Ok(mut ticker) = self.ticker.lock() {
            if let Some(handle) = ticker.take() {
                handle.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .map(|ticker| ticker.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Polls immediately with a fresh sequence, regardless of any poll in
    /// flight, and returns the newest published snapshot afterwards.
    pub async fn refresh_now(&self) -> Option<Arc<UsageSnapshot>> {
        self.state.refresh().await;
        self.latest()
    }

    pub fn latest(&self) -> Option<Arc<UsageSnapshot>> {
        self.state.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<UsageSnapshot>>> {
        self.state.snapshots.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state
            .last_error
            .lock()
            .ok()
            .and_then(|last| last.clone())
    }

    pub fn in_flight(&self) -> bool {
        self.state.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Stale when nothing has been published or the latest snapshot is older
    /// than two intervals.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let Some(snapshot) = self.latest() else {
            return true;
        };
        let max_age = chrono::Duration::from_std(self.state.interval * 2)
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        now.signed_duration_since(snapshot.fetched_at) > max_age
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One scheduler per workflow, created on first use.
#[derive(Clone)]
pub struct PollingRegistry {
    schedulers: Arc<DashMap<String, Arc<PollScheduler>>>,
    source: Arc<dyn UsageSource>,
    interval: Duration,
}

impl PollingRegistry {
    pub fn new(source: Arc<dyn UsageSource>, interval: Duration) -> Self {
        Self {
            schedulers: Arc::new(DashMap::new()),
            source,
            interval,
        }
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<PollScheduler>> {
        self.schedulers
            .get(workflow_id)
            .map(|entry| entry.value().clone())
    }

    pub fn get_or_start(&self, workflow_id: &str) -> Arc<PollScheduler> {
        self.schedulers
            .entry(workflow_id.to_string())
            .or_insert_with(|| {
                let scheduler = PollScheduler::new(workflow_id, self.source.clone(), self.interval);
                scheduler.start();
                Arc::new(scheduler)
            })
            .value()
            .clone()
    }

    pub fn stop(&self, workflow_id: &str) -> bool {
        match self.schedulers.remove(workflow_id) {
            Some((_, scheduler)) => {
                scheduler.stop();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }
}
