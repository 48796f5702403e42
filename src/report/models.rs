//! Status and incident payloads, serialized in the endpoints' PascalCase form.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Incident descriptions are cut to this many characters.
pub const MAX_DESCRIPTION_CHARS: usize = 4000;
/// Highest urgency tier; every offline detection uses it.
pub const INCIDENT_SEVERITY_CRITICAL: u8 = 4;
pub const INCIDENT_STATUS_OPEN: u8 = 1;
/// Source tag identifying this job on opened incidents.
pub const REPORTED_BY: &str = "pingwatch";

/// Reachability status as understood by the status service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Online = 1,
    Offline = 2,
}

impl StatusCode {
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            Self::Online
        } else {
            Self::Offline
        }
    }

    /// Fixed human message recorded with the status.
    pub fn message(self) -> &'static str {
        match self {
            Self::Online => "The server is online",
            Self::Offline => "The server is offline",
        }
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// One status history record per entity per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusEvent {
    pub entity_id: i64,
    pub status: StatusCode,
    pub status_message: String,
    pub checked_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(entity_id: i64, status: StatusCode, checked_at: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            status,
            status_message: status.message().to_string(),
            checked_at,
        }
    }
}

/// An incident opened for an unreachable entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Incident {
    pub entity_id: i64,
    pub title: String,
    pub description: String,
    pub severity: u8,
    pub status: u8,
    pub started_at: DateTime<Utc>,
    pub reported_by: String,
}

impl Incident {
    /// Open a critical incident; the description is truncated to
    /// [`MAX_DESCRIPTION_CHARS`].
    pub fn open(
        entity_id: i64,
        title: impl Into<String>,
        description: &str,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id,
            title: title.into(),
            description: truncate_chars(description, MAX_DESCRIPTION_CHARS).to_string(),
            severity: INCIDENT_SEVERITY_CRITICAL,
            status: INCIDENT_STATUS_OPEN,
            started_at,
            reported_by: REPORTED_BY.to_string(),
        }
    }
}

/// Cut `s` to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
