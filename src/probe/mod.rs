//! Probe module for reachability checks.
//!
//! A [`Prober`] never fails: every problem is folded into the returned
//! [`ProbeOutcome`].

mod ping;

pub use ping::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("probe mechanism failed: {0}")]
    Mechanism(String),
}

impl ProbeError {
    /// Whether the probing mechanism itself failed, as opposed to the
    /// target not answering.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::Mechanism(_))
    }
}

/// Result of one reachability check.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub reachable: bool,
    /// Round-trip time, only when reachable and timing was reported.
    pub latency_millis: Option<f64>,
    pub raw_error: Option<String>,
    /// The probing mechanism failed; the target's state is unknown.
    pub faulted: bool,
    pub checked_at: DateTime<Utc>,
}

impl ProbeOutcome {
    pub fn reachable(latency_millis: Option<f64>) -> Self {
        Self {
            reachable: true,
            latency_millis: latency_millis.filter(|ms| ms.is_finite() && *ms >= 0.0),
            raw_error: None,
            faulted: false,
            checked_at: Utc::now(),
        }
    }

    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            reachable: false,
            latency_millis: None,
            raw_error: Some(error.into()),
            faulted: false,
            checked_at: Utc::now(),
        }
    }

    pub fn fault(error: impl Into<String>) -> Self {
        Self {
            faulted: true,
            ..Self::unreachable(error)
        }
    }
}

impl From<ProbeError> for ProbeOutcome {
    fn from(err: ProbeError) -> Self {
        if err.is_fault() {
            Self::fault(err.to_string())
        } else {
            Self::unreachable(err.to_string())
        }
    }
}

/// A reachability check against one address.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `address` once, bounded by `timeout`.
    async fn probe(&self, address: &str, timeout: Duration) -> ProbeOutcome;
}
