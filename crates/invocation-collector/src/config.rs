//! Collector endpoint configuration.
//!
//! Loaded from, in order of priority:
//! 1. Default values
//! 2. Config file: `/var/task/invocation-collector.toml` (optional)
//! 3. `AWS_REGION`, as `region`
//! 4. Environment variables with the `INVOCATION_AGENT_COLLECTOR_` prefix
//!
//! Without an explicit `url` or `signer_url` the endpoints are derived from
//! the region.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/var/task/invocation-collector.toml";
const ENV_PREFIX: &str = "INVOCATION_AGENT_COLLECTOR_";

/// Regions with a dedicated collector.
pub const COLLECTOR_REGIONS: &[&str] = &[
    "ap-northeast-1",
    "ap-southeast-2",
    "eu-west-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
];

/// Regions with a dedicated signer.
pub const SIGNER_REGIONS: &[&str] = &[
    "ap-northeast-1",
    "ap-southeast-2",
    "eu-west-1",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
];

const DEFAULT_COLLECTOR_URL: &str = "https://metrics-api.iopipe.com/";
const DEFAULT_SIGNER_REGION: &str = "us-east-1";

/// Collector client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Collector base URL. Derived from `region` when unset.
    pub url: Option<String>,
    /// Signer URL. Derived from `region` when unset.
    pub signer_url: Option<String>,
    /// Network timeout in milliseconds.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// AWS region the function runs in.
    pub region: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            url: None,
            signer_url: None,
            timeout: Duration::from_secs(1),
            region: None,
        }
    }
}

impl CollectorConfig {
    /// # Errors
    ///
    /// Returns an error if a source is present but cannot be parsed.
    #[allow(clippy::result_large_err)]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// # Errors
    ///
    /// Returns an error if a source is present but cannot be parsed.
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(CollectorConfig::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        if let Ok(region) = std::env::var("AWS_REGION")
            && !region.is_empty()
        {
            figment = figment.merge(Serialized::default("region", region));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        figment.extract()
    }

    /// Collector base URL, always ending in `/`.
    pub fn collector_url(&self) -> String {
        match &self.url {
            Some(url) => with_trailing_slash(url),
            None => collector_url_for(self.region.as_deref()),
        }
    }

    pub fn event_url(&self) -> String {
        format!("{}v0/event", self.collector_url())
    }

    pub fn signer_url(&self) -> String {
        match &self.signer_url {
            Some(url) => url.clone(),
            None => signer_url_for(self.region.as_deref()),
        }
    }
}

/// Collector base URL for `region`; the global collector when the region has
/// none of its own.
pub fn collector_url_for(region: Option<&str>) -> String {
    match region {
        Some(region) if COLLECTOR_REGIONS.contains(&region) => {
            format!("https://metrics-api.{region}.iopipe.com/")
        }
        _ => DEFAULT_COLLECTOR_URL.to_string(),
    }
}

/// Signer URL for `region`, falling back to us-east-1.
pub fn signer_url_for(region: Option<&str>) -> String {
    let region = region
        .filter(|r| SIGNER_REGIONS.contains(r))
        .unwrap_or(DEFAULT_SIGNER_REGION);
    format!("https://signer.{region}.iopipe.com/")
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
