//! Per-entity results and run aggregates.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::report::{ReportOutcome, StatusCode};

/// Outcome of one entity within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityResult {
    pub entity_id: i64,
    pub name: String,
    pub address: String,
    pub reachable: bool,
    pub latency_millis: Option<f64>,
    pub error_message: Option<String>,
    pub status_code: StatusCode,
    pub status_message: String,
    pub checked_at: DateTime<Utc>,
    pub status_report: ReportOutcome,
    /// Absent when the entity was reachable and no incident was due.
    pub incident_report: Option<ReportOutcome>,
}

impl EntityResult {
    pub fn has_reporting_failure(&self) -> bool {
        self.status_report.is_failed()
            || self.incident_report.as_ref().is_some_and(ReportOutcome::is_failed)
    }
}

/// Aggregate statistics for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Mean over the results that carry a latency; absent when none do.
    pub avg_latency_millis: Option<f64>,
    pub reporting_failures: usize,
}

impl RunSummary {
    pub fn from_results(results: &[EntityResult]) -> Self {
        let succeeded = results.iter().filter(|r| r.reachable).count();
        let latencies: Vec<f64> = results.iter().filter_map(|r| r.latency_millis).collect();
        let avg_latency_millis = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            avg_latency_millis,
            reporting_failures: results.iter().filter(|r| r.has_reporting_failure()).count(),
        }
    }
}

/// Everything one run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// In entity input order.
    pub results: Vec<EntityResult>,
    pub summary: RunSummary,
}
