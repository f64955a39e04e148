//! Error types for the collector transport and request signer.

use thiserror::Error;

/// A specialised Result type for collector client construction.
pub type Result<T> = std::result::Result<T, CollectorError>;

/// Errors raised while setting up a collector client.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Configuration error.
    #[error("configuration error")]
    Config(#[source] Box<figment::Error>),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client")]
    Client(#[from] reqwest::Error),
}

impl From<figment::Error> for CollectorError {
    fn from(err: figment::Error) -> Self {
        CollectorError::Config(Box::new(err))
    }
}

/// Errors raised while requesting a signed upload URL.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SignerError {
    /// The agent has no token to authorise the request with.
    #[error("no token configured for the signer")]
    MissingToken,

    /// HTTP request failed.
    #[error("signer request failed")]
    Http(#[from] reqwest::Error),

    /// Signer returned an error status.
    #[error("signer returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body was not a signer response.
    #[error("failed to decode signer response")]
    Decode(#[source] serde_json::Error),
}

impl SignerError {
    pub(crate) fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }
}
