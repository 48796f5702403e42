//! Reporting module: status history and incident endpoints.

mod api;
mod models;

pub use api::*;
pub use models::*;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Reporting error types.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("{0} endpoint not configured")]
    NotConfigured(&'static str),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// What happened to one submission. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ReportOutcome {
    Delivered,
    /// The endpoint is not configured.
    Skipped,
    Failed(String),
}

impl ReportOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl From<Result<(), ReportError>> for ReportOutcome {
    fn from(result: Result<(), ReportError>) -> Self {
        match result {
            Ok(()) => Self::Delivered,
            Err(ReportError::NotConfigured(_)) => Self::Skipped,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

/// Records status events.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report_status(&self, event: &StatusEvent) -> Result<(), ReportError>;
}

/// Opens incidents.
#[async_trait]
pub trait IncidentOpener: Send + Sync {
    async fn open_incident(&self, incident: &Incident) -> Result<(), ReportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_result() {
        assert_eq!(ReportOutcome::from(Ok(())), ReportOutcome::Delivered);
        assert_eq!(
            ReportOutcome::from(Err(ReportError::NotConfigured("status"))),
            ReportOutcome::Skipped
        );

        let failed = ReportOutcome::from(Err(ReportError::Rejected {
            status: 500,
            body: "boom".to_string(),
        }));
        assert_eq!(
            failed,
            ReportOutcome::Failed("endpoint returned HTTP 500: boom".to_string())
        );
        assert!(failed.is_failed());
    }
}
