//! Report transport to the collector HTTP API.

use crate::config::CollectorConfig;
use crate::error::Result;
use async_trait::async_trait;
use invocation_agent::{Report, ReportError, Reporter};
use reqwest::Client;

/// Sends reports to `{collector}/v0/event`.
///
/// Each report is authorised with its own `client_id`.
#[derive(Debug, Clone)]
pub struct CollectorReporter {
    client: Client,
    url: String,
}

impl CollectorReporter {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            url: config.event_url(),
        })
    }

    /// Builds a reporter from [`CollectorConfig::load`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be parsed or the HTTP
    /// client cannot be created.
    pub fn from_env() -> Result<Self> {
        Self::new(&CollectorConfig::load()?)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Reporter for CollectorReporter {
    async fn send(&self, report: &Report) -> std::result::Result<(), ReportError> {
        let body = serde_json::to_vec(report)?;

        tracing::debug!(
            url = %self.url,
            request_id = %report.aws.aws_request_id,
            bytes = body.len(),
            "Sending report"
        );

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Authorization", &report.client_id)
            .body(body)
            .send()
            .await
            .map_err(ReportError::transport)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ReportError::status(status.as_u16(), body))
        }
    }
}
