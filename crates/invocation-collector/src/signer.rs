//! Signed upload URLs for plugins that attach files to a report.

use crate::config::CollectorConfig;
use crate::error::{Result, SignerError};
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignerRequest<'a> {
    arn: &'a str,
    request_id: &'a str,
    timestamp: i64,
    extension: &'a str,
}

/// A pre-signed upload destination.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedRequest {
    /// Token granting read access to the uploaded file.
    pub jwt_access: String,
    /// URL to `PUT` the file to.
    pub signed_request: String,
    /// Where the file can be fetched once uploaded.
    pub url: String,
}

/// Client for the regional signer.
#[derive(Debug, Clone)]
pub struct SignerClient {
    client: Client,
    url: String,
    token: String,
}

impl SignerClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(token: impl Into<String>, config: &CollectorConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            url: config.signer_url(),
            token: token.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Requests an upload URL for a file with `extension` belonging to the
    /// invocation described by `context`.
    ///
    /// # Errors
    ///
    /// Fails without a token, on transport errors, non-success statuses, and
    /// bodies that are not a signer response.
    pub async fn signed_request(
        &self,
        context: &lambda_runtime::Context,
        extension: &str,
    ) -> std::result::Result<SignedRequest, SignerError> {
        if self.token.is_empty() {
            return Err(SignerError::MissingToken);
        }

        let request = SignerRequest {
            arn: &context.invoked_function_arn,
            request_id: &context.request_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            extension,
        };

        tracing::debug!(url = %self.url, request_id = %context.request_id, extension, "Requesting signed upload");

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", &self.token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SignerError::status(status.as_u16(), body));
        }

        serde_json::from_str(&body).map_err(SignerError::Decode)
    }
}
