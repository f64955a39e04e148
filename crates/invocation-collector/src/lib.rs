//! HTTP transport and request signing for the invocation agent.
//!
//! [`CollectorReporter`] delivers reports to the collector API in the
//! function's region. [`SignerClient`] obtains pre-signed upload URLs for
//! plugins that attach files to an invocation.
//!
//! ```no_run
//! use invocation_agent::Agent;
//! use invocation_collector::CollectorReporter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = Agent::builder()
//!     .token("client-token")
//!     .reporter(CollectorReporter::from_env()?)
//!     .build()
//!     .await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod reporter;
mod signer;

pub use config::{
    COLLECTOR_REGIONS, CollectorConfig, SIGNER_REGIONS, collector_url_for, signer_url_for,
};
pub use error::{CollectorError, Result, SignerError};
pub use reporter::CollectorReporter;
pub use signer::{SignedRequest, SignerClient};
