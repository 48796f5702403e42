//! JSON-over-HTTP client for the status and incident endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode as HttpStatus};
use serde::Serialize;

use super::models::{truncate_chars, Incident, StatusEvent};
use super::{IncidentOpener, ReportError, StatusReporter};
use crate::config::MonitorConfig;

/// Response bodies are kept in errors up to this many characters.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Posts status events and incidents to their configured endpoints.
///
/// A missing URL is not an error of the endpoint: submissions to it return
/// [`ReportError::NotConfigured`] and are skipped.
pub struct ApiReporter {
    client: Client,
    status_url: Option<String>,
    incident_url: Option<String>,
}

impl ApiReporter {
    pub fn new(
        status_url: Option<String>,
        incident_url: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, ReportError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            status_url,
            incident_url,
        })
    }

    pub fn from_config(cfg: &MonitorConfig) -> Result<Self, ReportError> {
        Self::new(
            cfg.status_api_url.clone(),
            cfg.incident_api_url.clone(),
            cfg.request_timeout,
        )
    }

    async fn post_json<T: Serialize + Sync>(
        &self,
        endpoint: &'static str,
        url: Option<&str>,
        entity_id: i64,
        payload: &T,
    ) -> Result<(), ReportError> {
        let Some(url) = url else {
            tracing::warn!(endpoint, entity_id, "Endpoint URL not configured, skipping");
            return Err(ReportError::NotConfigured(endpoint));
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            let body = serde_json::to_string(payload).unwrap_or_default();
            tracing::debug!(endpoint, entity_id, url, payload = %body, "Posting to endpoint");
        }

        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(endpoint, entity_id, url, error = %e, "Request failed");
                ReportError::from(e)
            })?;

        let status = response.status();
        if status != HttpStatus::OK {
            let body = response.text().await.unwrap_or_default();
            let body = truncate_chars(body.trim(), MAX_ERROR_BODY_CHARS).to_string();
            tracing::error!(endpoint, entity_id, status = status.as_u16(), body = %body, "Endpoint rejected submission");
            return Err(ReportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(endpoint, entity_id, "Submission accepted");
        Ok(())
    }
}

#[async_trait]
impl StatusReporter for ApiReporter {
    async fn report_status(&self, event: &StatusEvent) -> Result<(), ReportError> {
        self.post_json("status", self.status_url.as_deref(), event.entity_id, event)
            .await
    }
}

#[async_trait]
impl IncidentOpener for ApiReporter {
    async fn open_incident(&self, incident: &Incident) -> Result<(), ReportError> {
        self.post_json("incident", self.incident_url.as_deref(), incident.entity_id, incident)
            .await
    }
}
