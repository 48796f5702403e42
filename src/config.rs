//! Configuration module for pingwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::db::SERVER_ENTITY_TYPE;

/// Monitor configuration loaded once at startup and passed to constructors.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Path to the SQLite inventory database (default: "pingwatch.db")
    pub db_path: String,
    /// Entity type flag selecting the monitored rows (default: 1, servers)
    pub entity_type: i64,
    /// Status history endpoint; reporting is skipped when unset
    pub status_api_url: Option<String>,
    /// Incident endpoint; incident creation is skipped when unset
    pub incident_api_url: Option<String>,
    /// Timeout for a single reachability probe (default: 1s)
    pub probe_timeout: Duration,
    /// Timeout for status and incident requests (default: 30s)
    pub request_timeout: Duration,
    /// Interval between scheduled runs (default: 5 minutes)
    pub run_interval: Duration,
    /// Entities probed concurrently within one run (default: 8)
    pub max_concurrent_probes: usize,
    /// HTTP port for the run report surface, 0 disables it (default: 8080)
    pub http_port: u16,
    /// Perform a single run and exit instead of scheduling
    pub run_once: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            db_path: "pingwatch.db".to_string(),
            entity_type: SERVER_ENTITY_TYPE,
            status_api_url: None,
            incident_api_url: None,
            probe_timeout: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
            run_interval: Duration::from_secs(300),
            max_concurrent_probes: 8,
            http_port: 8080,
            run_once: false,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PINGWATCH_DB_PATH`: Database file path (default: "pingwatch.db")
    /// - `PINGWATCH_ENTITY_TYPE`: Monitored entity type (default: 1)
    /// - `PINGWATCH_STATUS_API_URL`: Status history endpoint
    /// - `PINGWATCH_INCIDENT_API_URL`: Incident endpoint
    /// - `PINGWATCH_PROBE_TIMEOUT_MS`: Probe timeout (default: 1000)
    /// - `PINGWATCH_REQUEST_TIMEOUT_SECS`: API request timeout (default: 30)
    /// - `PINGWATCH_RUN_INTERVAL_SECS`: Run interval (default: 300)
    /// - `PINGWATCH_MAX_CONCURRENT_PROBES`: Probe concurrency (default: 8)
    /// - `PINGWATCH_HTTP_PORT`: HTTP port, 0 disables (default: 8080)
    /// - `PINGWATCH_RUN_ONCE`: "1"/"true" for a single run
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(db_path) = non_empty(lookup("PINGWATCH_DB_PATH")) {
            cfg.db_path = db_path;
        }
        if let Some(entity_type) = parse_var(&lookup, "PINGWATCH_ENTITY_TYPE") {
            cfg.entity_type = entity_type;
        }

        cfg.status_api_url = non_empty(lookup("PINGWATCH_STATUS_API_URL"));
        cfg.incident_api_url = non_empty(lookup("PINGWATCH_INCIDENT_API_URL"));

        if let Some(ms) = parse_var::<u64, _>(&lookup, "PINGWATCH_PROBE_TIMEOUT_MS") {
            if ms > 0 {
                cfg.probe_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PINGWATCH_REQUEST_TIMEOUT_SECS") {
            if secs > 0 {
                cfg.request_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PINGWATCH_RUN_INTERVAL_SECS") {
            if secs > 0 {
                cfg.run_interval = Duration::from_secs(secs);
            }
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "PINGWATCH_MAX_CONCURRENT_PROBES") {
            cfg.max_concurrent_probes = n.max(1);
        }
        if let Some(port) = parse_var(&lookup, "PINGWATCH_HTTP_PORT") {
            cfg.http_port = port;
        }
        if let Some(flag) = non_empty(lookup("PINGWATCH_RUN_ONCE")) {
            cfg.run_once = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        cfg
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = non_empty(lookup(key))?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}
