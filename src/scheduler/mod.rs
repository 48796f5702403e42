//! Scheduler module for triggering monitoring runs.
//!
//! At most one run is in flight at a time; a trigger that arrives while a
//! run is active is skipped.

use crate::monitor::{Reconciler, RunReport};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, OwnedSemaphorePermit, RwLock, Semaphore};

/// Fraction of the interval a run may take before it is reported as degraded.
const DEGRADED_RUN_RATIO: f64 = 0.8;

/// The outcome of the most recent run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunRecord {
    Completed(RunReport),
    Failed {
        failed_at: DateTime<Utc>,
        error: String,
    },
}

/// Periodically triggers runs of the reconciliation loop.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    in_flight: Arc<Semaphore>,
    latest: RwLock<Option<RunRecord>>,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            in_flight: Arc::new(Semaphore::new(1)),
            latest: RwLock::new(None),
        }
    }

    /// Trigger a run every interval until shutdown. The first run starts
    /// immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Starting scheduler");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Scheduler received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    if !self.spawn_run() {
                        tracing::warn!("Skipping scheduled run, previous run still in flight");
                    }
                }
            }
        }
    }

    /// Start a run in the background. Returns false when one is in flight.
    pub fn spawn_run(self: &Arc<Self>) -> bool {
        let Some(permit) = self.try_acquire() else {
            return false;
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.execute(permit).await;
        });
        true
    }

    /// Run once and wait for the result. Returns `None` when a run is
    /// already in flight.
    pub async fn run_once(&self) -> Option<RunRecord> {
        let permit = self.try_acquire()?;
        Some(self.execute(permit).await)
    }

    /// The most recent finished run, if any.
    pub async fn latest(&self) -> Option<RunRecord> {
        self.latest.read().await.clone()
    }

    fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.in_flight.clone().try_acquire_owned().ok()
    }

    async fn execute(&self, _permit: OwnedSemaphorePermit) -> RunRecord {
        let started = Instant::now();

        let record = match self.reconciler.run().await {
            Ok(report) => RunRecord::Completed(report),
            Err(e) => {
                tracing::error!(error = %e, "Run failed");
                RunRecord::Failed {
                    failed_at: Utc::now(),
                    error: e.to_string(),
                }
            }
        };

        let elapsed = started.elapsed();
        if elapsed.as_secs_f64() >= self.interval.as_secs_f64() * DEGRADED_RUN_RATIO {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                interval_secs = self.interval.as_secs(),
                "Run took most of the schedule interval"
            );
        } else {
            tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, "Run finished");
        }

        *self.latest.write().await = Some(record.clone());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Entity, EntitySource, SourceError};
    use crate::monitor::RunSettings;
    use crate::probe::{ProbeOutcome, Prober};
    use crate::report::{Incident, IncidentOpener, ReportError, StatusEvent, StatusReporter};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Holds the entity list until released, or fails when `fail` is set.
    struct GatedSource {
        gate: Arc<Notify>,
        fail: bool,
    }

    #[async_trait]
    impl EntitySource for GatedSource {
        async fn fetch_entities(&self) -> Result<Vec<Entity>, SourceError> {
            self.gate.notified().await;
            if self.fail {
                return Err(SourceError::Unavailable("connection refused".to_string()));
            }
            Ok(vec![Entity::new(1, "10.0.0.5", "10.0.0.5")])
        }
    }

    struct AlwaysUp;

    #[async_trait]
    impl Prober for AlwaysUp {
        async fn probe(&self, _address: &str, _timeout: Duration) -> ProbeOutcome {
            ProbeOutcome::reachable(Some(12.0))
        }
    }

    struct Accepting;

    #[async_trait]
    impl StatusReporter for Accepting {
        async fn report_status(&self, _event: &StatusEvent) -> Result<(), ReportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl IncidentOpener for Accepting {
        async fn open_incident(&self, _incident: &Incident) -> Result<(), ReportError> {
            Ok(())
        }
    }

    fn scheduler(gate: Arc<Notify>, fail: bool) -> Arc<Scheduler> {
        let reconciler = Reconciler::new(
            Arc::new(GatedSource { gate, fail }),
            Arc::new(AlwaysUp),
            Arc::new(Accepting),
            Arc::new(Accepting),
            RunSettings {
                probe_timeout: Duration::from_millis(100),
                max_concurrency: 1,
            },
        );
        Arc::new(Scheduler::new(Arc::new(reconciler), Duration::from_secs(300)))
    }

    async fn wait_for_latest(scheduler: &Scheduler) -> RunRecord {
        for _ in 0..200 {
            if let Some(record) = scheduler.latest().await {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never finished");
    }

    #[tokio::test]
    async fn test_trigger_while_in_flight_is_skipped() {
        let gate = Arc::new(Notify::new());
        let scheduler = scheduler(gate.clone(), false);

        assert!(scheduler.spawn_run());
        assert!(!scheduler.spawn_run());
        assert!(scheduler.run_once().await.is_none());
        assert!(scheduler.latest().await.is_none());

        gate.notify_one();
        match wait_for_latest(&scheduler).await {
            RunRecord::Completed(report) => assert_eq!(report.summary.succeeded, 1),
            other => panic!("unexpected record: {other:?}"),
        }

        // The guard is released once the run finished
        gate.notify_one();
        assert!(scheduler.run_once().await.is_some());
    }

    #[tokio::test]
    async fn test_source_failure_recorded() {
        let gate = Arc::new(Notify::new());
        let scheduler = scheduler(gate.clone(), true);

        gate.notify_one();
        let record = scheduler.run_once().await.unwrap();
        match record {
            RunRecord::Failed { error, .. } => assert!(error.contains("connection refused")),
            other => panic!("unexpected record: {other:?}"),
        }
        assert!(matches!(scheduler.latest().await, Some(RunRecord::Failed { .. })));
    }

    #[tokio::test]
    async fn test_record_serializes_with_state_tag() {
        let record = RunRecord::Failed {
            failed_at: Utc::now(),
            error: "entity source unavailable".to_string(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["state"], "failed");
        assert_eq!(value["error"], "entity source unavailable");
    }
}
