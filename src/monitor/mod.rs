//! Reconciliation loop.
//!
//! One run reads the entity list, probes every entity, records a status for
//! each and opens an incident for each unreachable one. Per-entity failures
//! (prober faults, reporting errors) are folded into that entity's result;
//! only a failure to read the entity list fails the run.

mod models;

pub use models::*;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use thiserror::Error;

use crate::config::MonitorConfig;
use crate::db::{Entity, EntitySource, SourceError};
use crate::probe::{ProbeOutcome, Prober};
use crate::report::{
    Incident, IncidentOpener, ReportOutcome, StatusCode, StatusEvent, StatusReporter,
};

/// Slack on top of the probe timeout before a probe is abandoned.
pub const PROBE_GRACE: Duration = Duration::from_secs(2);

/// Run-level failure. Nothing else escapes a run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("entity source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),
}

/// Tunables for a run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub probe_timeout: Duration,
    /// Entities in flight at once; 1 processes them strictly in order.
    pub max_concurrency: usize,
}

impl RunSettings {
    pub fn from_config(cfg: &MonitorConfig) -> Self {
        Self {
            probe_timeout: cfg.probe_timeout,
            max_concurrency: cfg.max_concurrent_probes,
        }
    }
}

/// Drives one monitoring run over its collaborators.
pub struct Reconciler {
    source: Arc<dyn EntitySource>,
    prober: Arc<dyn Prober>,
    status_reporter: Arc<dyn StatusReporter>,
    incident_opener: Arc<dyn IncidentOpener>,
    settings: RunSettings,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn EntitySource>,
        prober: Arc<dyn Prober>,
        status_reporter: Arc<dyn StatusReporter>,
        incident_opener: Arc<dyn IncidentOpener>,
        settings: RunSettings,
    ) -> Self {
        Self {
            source,
            prober,
            status_reporter,
            incident_opener,
            settings,
        }
    }

    /// Execute one run.
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let started_at = Utc::now();

        let entities = self.source.fetch_entities().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to retrieve entities, aborting run");
            RunError::from(e)
        })?;
        tracing::info!(count = entities.len(), "Retrieved entities");

        let results: Vec<EntityResult> = stream::iter(entities)
            .map(|entity| self.reconcile_entity(entity))
            .buffered(self.settings.max_concurrency.max(1))
            .collect()
            .await;

        let summary = RunSummary::from_results(&results);
        log_summary(&summary, &results);

        Ok(RunReport {
            started_at,
            finished_at: Utc::now(),
            results,
            summary,
        })
    }

    async fn reconcile_entity(&self, entity: Entity) -> EntityResult {
        tracing::debug!(entity_id = entity.id, name = %entity.name, address = %entity.address, "Probing entity");

        let outcome = self.probe(&entity.address).await;
        let status = StatusCode::from_reachable(outcome.reachable);

        if outcome.faulted {
            tracing::error!(
                entity_id = entity.id,
                address = %entity.address,
                error = outcome.raw_error.as_deref().unwrap_or_default(),
                "Prober fault, treating entity as offline"
            );
        }
        tracing::info!(
            entity_id = entity.id,
            address = %entity.address,
            status = status.message(),
            latency_ms = outcome.latency_millis,
            error = outcome.raw_error.as_deref(),
            "Probe complete"
        );

        let event = StatusEvent::new(entity.id, status, outcome.checked_at);
        let status_report = ReportOutcome::from(self.status_reporter.report_status(&event).await);

        let incident_report = match build_incident(&entity, &outcome) {
            Some(incident) => {
                let report = ReportOutcome::from(self.incident_opener.open_incident(&incident).await);
                tracing::info!(entity_id = entity.id, title = %incident.title, outcome = ?report, "Incident submitted");
                Some(report)
            }
            None => None,
        };

        let error_message = if outcome.reachable {
            None
        } else {
            Some(outcome.raw_error.clone().unwrap_or_else(|| "Ping failed".to_string()))
        };

        EntityResult {
            entity_id: entity.id,
            name: entity.name,
            address: entity.address,
            reachable: outcome.reachable,
            latency_millis: outcome.latency_millis,
            error_message,
            status_code: status,
            status_message: event.status_message,
            checked_at: outcome.checked_at,
            status_report,
            incident_report,
        }
    }

    /// Probe in a separate task so a panicking or stuck prober only costs
    /// this entity.
    async fn probe(&self, address: &str) -> ProbeOutcome {
        let prober = self.prober.clone();
        let target = address.to_string();
        let timeout = self.settings.probe_timeout;
        let hard_limit = timeout + PROBE_GRACE;

        let mut task = tokio::spawn(async move { prober.probe(&target, timeout).await });

        match tokio::time::timeout(hard_limit, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ProbeOutcome::fault(format!("prober task failed: {}", e)),
            Err(_) => {
                task.abort();
                ProbeOutcome::unreachable(format!("probe exceeded hard timeout of {:?}", hard_limit))
            }
        }
    }
}

/// The incident to open for an outcome, if any. Only unreachable outcomes
/// produce one.
pub fn build_incident(entity: &Entity, outcome: &ProbeOutcome) -> Option<Incident> {
    if outcome.reachable {
        return None;
    }

    let (title, description) = if outcome.faulted {
        (
            format!("Server '{}' ping error", entity.name),
            format!(
                "Error while pinging server {} ({}): {}",
                entity.name,
                entity.address,
                outcome.raw_error.as_deref().unwrap_or("unknown error")
            ),
        )
    } else {
        (
            format!("Server '{}' is offline", entity.name),
            format!(
                "Ping to server {} ({}) failed. Error: {}",
                entity.name,
                entity.address,
                outcome
                    .raw_error
                    .as_deref()
                    .unwrap_or("Ping timeout or unreachable")
            ),
        )
    };

    Some(Incident::open(entity.id, title, &description, Utc::now()))
}

fn log_summary(summary: &RunSummary, results: &[EntityResult]) {
    tracing::info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        avg_latency_ms = summary.avg_latency_millis,
        reporting_failures = summary.reporting_failures,
        "Run complete"
    );

    for result in results {
        tracing::info!(
            entity_id = result.entity_id,
            name = %result.name,
            address = %result.address,
            online = result.reachable,
            latency_ms = result.latency_millis,
            "Entity result"
        );
        if result.has_reporting_failure() {
            tracing::warn!(
                entity_id = result.entity_id,
                status_report = ?result.status_report,
                incident_report = ?result.incident_report,
                "Reporting fault"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeSource {
        entities: Option<Vec<Entity>>,
    }

    #[async_trait]
    impl EntitySource for FakeSource {
        async fn fetch_entities(&self) -> Result<Vec<Entity>, SourceError> {
            self.entities
                .clone()
                .ok_or_else(|| SourceError::Unavailable("connection refused".to_string()))
        }
    }

    #[derive(Clone)]
    enum Behavior {
        Answer(ProbeOutcome),
        AnswerAfter(Duration, ProbeOutcome),
        Panic,
        Hang,
    }

    #[derive(Default)]
    struct ScriptedProber {
        script: HashMap<String, Behavior>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProber {
        fn with(mut self, address: &str, behavior: Behavior) -> Self {
            self.script.insert(address.to_string(), behavior);
            self
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, address: &str, _timeout: Duration) -> ProbeOutcome {
            self.calls.lock().unwrap().push(address.to_string());
            let behavior = self.script.get(address).cloned();
            match behavior {
                Some(Behavior::Answer(outcome)) => outcome,
                Some(Behavior::AnswerAfter(delay, outcome)) => {
                    tokio::time::sleep(delay).await;
                    outcome
                }
                Some(Behavior::Panic) => panic!("ping binary missing"),
                Some(Behavior::Hang) => std::future::pending().await,
                None => ProbeOutcome::unreachable("no route to host"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        statuses: Mutex<Vec<StatusEvent>>,
        incidents: Mutex<Vec<Incident>>,
        fail_status: bool,
        fail_incident: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StatusReporter for RecordingReporter {
        async fn report_status(&self, event: &StatusEvent) -> Result<(), ReportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.statuses.lock().unwrap().push(event.clone());
            if self.fail_status {
                return Err(ReportError::Rejected {
                    status: 500,
                    body: "internal error".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl IncidentOpener for RecordingReporter {
        async fn open_incident(&self, incident: &Incident) -> Result<(), ReportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.incidents.lock().unwrap().push(incident.clone());
            if self.fail_incident {
                return Err(ReportError::Rejected {
                    status: 500,
                    body: "internal error".to_string(),
                });
            }
            Ok(())
        }
    }

    fn reconciler(
        entities: Option<Vec<Entity>>,
        prober: Arc<ScriptedProber>,
        reporter: Arc<RecordingReporter>,
        max_concurrency: usize,
    ) -> Reconciler {
        Reconciler::new(
            Arc::new(FakeSource { entities }),
            prober,
            reporter.clone(),
            reporter,
            RunSettings {
                probe_timeout: Duration::from_millis(100),
                max_concurrency,
            },
        )
    }

    #[tokio::test]
    async fn test_online_entity() {
        let prober = Arc::new(
            ScriptedProber::default()
                .with("10.0.0.5", Behavior::Answer(ProbeOutcome::reachable(Some(12.0)))),
        );
        let reporter = Arc::new(RecordingReporter::default());
        let entities = vec![Entity::new(1, "10.0.0.5", "10.0.0.5")];

        let report = reconciler(Some(entities), prober, reporter.clone(), 1)
            .run()
            .await
            .unwrap();

        let statuses = reporter.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].entity_id, 1);
        assert_eq!(statuses[0].status, StatusCode::Online);
        assert_eq!(statuses[0].status_message, "The server is online");
        assert!(reporter.incidents.lock().unwrap().is_empty());

        assert_eq!(
            report.summary,
            RunSummary {
                total: 1,
                succeeded: 1,
                failed: 0,
                avg_latency_millis: Some(12.0),
                reporting_failures: 0,
            }
        );
        let result = &report.results[0];
        assert!(result.reachable);
        assert_eq!(result.error_message, None);
        assert_eq!(result.status_report, ReportOutcome::Delivered);
        assert_eq!(result.incident_report, None);
    }

    #[tokio::test]
    async fn test_offline_entity_opens_incident() {
        let prober = Arc::new(
            ScriptedProber::default()
                .with("bad-host", Behavior::Answer(ProbeOutcome::unreachable("timeout"))),
        );
        let reporter = Arc::new(RecordingReporter::default());
        let entities = vec![Entity::new(2, "bad-host", "bad-host")];

        let report = reconciler(Some(entities), prober, reporter.clone(), 1)
            .run()
            .await
            .unwrap();

        let statuses = reporter.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].entity_id, 2);
        assert_eq!(statuses[0].status, StatusCode::Offline);
        assert_eq!(statuses[0].status_message, "The server is offline");

        let incidents = reporter.incidents.lock().unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].title, "Server 'bad-host' is offline");
        assert_eq!(
            incidents[0].description,
            "Ping to server bad-host (bad-host) failed. Error: timeout"
        );
        assert_eq!(incidents[0].severity, 4);
        assert_eq!(incidents[0].status, 1);

        assert_eq!(
            report.summary,
            RunSummary {
                total: 1,
                succeeded: 0,
                failed: 1,
                avg_latency_millis: None,
                reporting_failures: 0,
            }
        );
        assert_eq!(report.results[0].error_message.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_incident_only_for_unreachable() {
        let prober = Arc::new(
            ScriptedProber::default()
                .with("a", Behavior::Answer(ProbeOutcome::reachable(None)))
                .with("b", Behavior::Answer(ProbeOutcome::unreachable("100% packet loss")))
                .with("c", Behavior::Answer(ProbeOutcome::reachable(Some(3.0))))
                .with("d", Behavior::Answer(ProbeOutcome::unreachable("unknown host"))),
        );
        let reporter = Arc::new(RecordingReporter::default());
        let entities = ["a", "b", "c", "d"]
            .iter()
            .enumerate()
            .map(|(i, name)| Entity::new(i as i64 + 1, *name, *name))
            .collect();

        let report = reconciler(Some(entities), prober, reporter.clone(), 4)
            .run()
            .await
            .unwrap();

        assert_eq!(reporter.statuses.lock().unwrap().len(), 4);
        let incident_ids: Vec<i64> = reporter
            .incidents
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.entity_id)
            .collect();
        assert_eq!(incident_ids, vec![2, 4]);

        // A reachable outcome without timing keeps latency absent
        assert!(report.results[0].reachable);
        assert_eq!(report.results[0].latency_millis, None);
        assert_eq!(report.summary.avg_latency_millis, Some(3.0));
    }

    #[tokio::test]
    async fn test_reporting_failures_do_not_stop_run() {
        let prober = Arc::new(
            ScriptedProber::default()
                .with("up", Behavior::Answer(ProbeOutcome::reachable(Some(5.0))))
                .with("down", Behavior::Answer(ProbeOutcome::unreachable("timeout"))),
        );
        let reporter = Arc::new(RecordingReporter {
            fail_status: true,
            fail_incident: true,
            ..Default::default()
        });
        let entities = vec![
            Entity::new(1, "up", "up"),
            Entity::new(2, "down", "down"),
            Entity::new(3, "up-again", "up"),
        ];

        let report = reconciler(Some(entities), prober, reporter.clone(), 1)
            .run()
            .await
            .unwrap();

        assert_eq!(report.results.len(), 3);
        assert_eq!(reporter.statuses.lock().unwrap().len(), 3);
        assert_eq!(reporter.incidents.lock().unwrap().len(), 1);

        assert!(report.results[0].reachable);
        assert_eq!(report.results[0].status_code, StatusCode::Online);
        assert!(report.results[0].status_report.is_failed());
        assert!(!report.results[1].reachable);
        assert_eq!(report.results[1].status_code, StatusCode::Offline);
        assert!(report.results[1]
            .incident_report
            .as_ref()
            .is_some_and(ReportOutcome::is_failed));
        assert!(report.results[2].reachable);
        assert_eq!(report.summary.reporting_failures, 3);
    }

    #[tokio::test]
    async fn test_source_failure_fails_run_before_probing() {
        let prober = Arc::new(ScriptedProber::default());
        let reporter = Arc::new(RecordingReporter::default());

        let err = reconciler(None, prober.clone(), reporter.clone(), 1)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::SourceUnavailable(_)));
        assert!(prober.calls.lock().unwrap().is_empty());
        assert_eq!(reporter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_entity_set() {
        let prober = Arc::new(ScriptedProber::default());
        let reporter = Arc::new(RecordingReporter::default());

        let report = reconciler(Some(Vec::new()), prober, reporter.clone(), 8)
            .run()
            .await
            .unwrap();

        assert!(report.results.is_empty());
        assert_eq!(report.summary.total, 0);
        assert_eq!(report.summary.avg_latency_millis, None);
        assert_eq!(reporter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_prober_panic_is_a_ping_error() {
        let prober = Arc::new(
            ScriptedProber::default()
                .with("broken", Behavior::Panic)
                .with("fine", Behavior::Answer(ProbeOutcome::reachable(Some(1.0)))),
        );
        let reporter = Arc::new(RecordingReporter::default());
        let entities = vec![
            Entity::new(1, "core-switch", "broken"),
            Entity::new(2, "fine", "fine"),
        ];

        let report = reconciler(Some(entities), prober, reporter.clone(), 1)
            .run()
            .await
            .unwrap();

        assert!(!report.results[0].reachable);
        assert!(report.results[0]
            .error_message
            .as_deref()
            .is_some_and(|e| e.starts_with("prober task failed")));
        assert!(report.results[1].reachable);

        let incidents = reporter.incidents.lock().unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].title, "Server 'core-switch' ping error");
        assert!(incidents[0]
            .description
            .starts_with("Error while pinging server core-switch (broken): "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_prober_hits_hard_timeout() {
        let prober = Arc::new(ScriptedProber::default().with("slow", Behavior::Hang));
        let reporter = Arc::new(RecordingReporter::default());
        let entities = vec![Entity::new(9, "slow", "slow")];

        let report = reconciler(Some(entities), prober, reporter.clone(), 1)
            .run()
            .await
            .unwrap();

        let result = &report.results[0];
        assert!(!result.reachable);
        assert!(result
            .error_message
            .as_deref()
            .is_some_and(|e| e.contains("hard timeout")));
        assert_eq!(reporter.incidents.lock().unwrap()[0].title, "Server 'slow' is offline");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_results_keep_input_order() {
        let prober = Arc::new(
            ScriptedProber::default()
                .with(
                    "first",
                    Behavior::AnswerAfter(Duration::from_millis(90), ProbeOutcome::reachable(Some(90.0))),
                )
                .with(
                    "second",
                    Behavior::AnswerAfter(Duration::from_millis(10), ProbeOutcome::reachable(Some(10.0))),
                )
                .with("third", Behavior::Answer(ProbeOutcome::unreachable("timeout"))),
        );
        let reporter = Arc::new(RecordingReporter::default());
        let entities = vec![
            Entity::new(1, "first", "first"),
            Entity::new(2, "second", "second"),
            Entity::new(3, "third", "third"),
        ];

        let report = reconciler(Some(entities), prober, reporter, 3)
            .run()
            .await
            .unwrap();

        let ids: Vec<i64> = report.results.iter().map(|r| r.entity_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(report.summary.avg_latency_millis, Some(50.0));
    }

    #[tokio::test]
    async fn test_empty_address_reaches_prober() {
        let prober = Arc::new(ScriptedProber::default());
        let reporter = Arc::new(RecordingReporter::default());
        let entities = vec![Entity::new(4, "nameless", "")];

        let report = reconciler(Some(entities), prober.clone(), reporter, 1)
            .run()
            .await
            .unwrap();

        assert_eq!(*prober.calls.lock().unwrap(), vec![String::new()]);
        assert!(!report.results[0].reachable);
    }

    #[test]
    fn test_build_incident_truncates_description() {
        let entity = Entity::new(1, "web-01", "10.0.0.5");
        let outcome = ProbeOutcome::unreachable("e".repeat(5000));
        let incident = build_incident(&entity, &outcome).unwrap();
        assert_eq!(incident.description.chars().count(), 4000);

        assert!(build_incident(&entity, &ProbeOutcome::reachable(None)).is_none());
    }
}
