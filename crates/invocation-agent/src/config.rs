//! Configuration loading.
//!
//! Layered with figment, later sources overriding earlier ones:
//! 1. Default values (compiled in)
//! 2. Config file: `/var/task/invocation-agent.toml` (optional)
//! 3. Legacy `IOPIPE_*` environment variables
//! 4. Environment variables with the `INVOCATION_AGENT_` prefix
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `INVOCATION_AGENT_TOKEN` | `token` | empty (agent passes through) |
//! | `INVOCATION_AGENT_ENABLED` | `enabled` | `true` |
//! | `INVOCATION_AGENT_DEBUG` | `debug` | `false` |
//! | `INVOCATION_AGENT_TIMEOUT_WINDOW` | `timeout_window` (ms) | `150` |

use crate::error::Result;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "/var/task/invocation-agent.toml";
const ENV_PREFIX: &str = "INVOCATION_AGENT_";

/// Default margin before the deadline at which an invocation is reported as
/// timed out.
pub const DEFAULT_TIMEOUT_WINDOW: Duration = Duration::from_millis(150);

/// Agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Collector client token. An empty token disables instrumentation.
    pub token: String,
    /// Whether handlers are instrumented at all.
    pub enabled: bool,
    /// Verbose agent logging.
    pub debug: bool,
    /// Margin before the deadline, in milliseconds.
    #[serde(with = "duration_ms")]
    pub timeout_window: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            enabled: true,
            debug: false,
            timeout_window: DEFAULT_TIMEOUT_WINDOW,
        }
    }
}

impl AgentConfig {
    /// Loads configuration from the default file location and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is present but cannot be parsed.
    #[allow(clippy::result_large_err)]
    pub fn load() -> std::result::Result<Self, figment::Error> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration using a custom config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is present but cannot be parsed.
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> std::result::Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(AgentConfig::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        figment = figment.merge(legacy_env());
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        figment.extract()
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Whether a decorated handler will actually be instrumented.
    pub fn is_instrumenting(&self) -> bool {
        self.enabled && !self.token.is_empty()
    }
}

/// Builder for constructing configuration programmatically.
#[must_use = "builders do nothing unless .build() is called"]
pub struct ConfigBuilder {
    config: AgentConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn timeout_window(mut self, window: Duration) -> Self {
        self.config.timeout_window = window;
        self
    }

    pub fn build(self) -> AgentConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Serialize)]
struct LegacyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_window: Option<u64>,
}

fn legacy_env() -> Serialized<LegacyConfig> {
    let mut config = LegacyConfig::default();

    if let Ok(token) = std::env::var("IOPIPE_TOKEN") {
        config.token = Some(token);
    }
    if let Ok(enabled) = std::env::var("IOPIPE_ENABLED") {
        config.enabled = parse_flag(&enabled);
    }
    if let Ok(debug) = std::env::var("IOPIPE_DEBUG") {
        config.debug = parse_flag(&debug);
    }
    if let Ok(window) = std::env::var("IOPIPE_TIMEOUT_WINDOW") {
        config.timeout_window = window.trim().parse().ok();
    }

    Serialized::defaults(config)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Installs a global tracing subscriber for the agent.
///
/// `RUST_LOG` takes precedence. Otherwise logs at `info`, with the agent's
/// own target at `debug` when `config.debug` is set.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(config: &AgentConfig) -> Result<()> {
    let default_directive = if config.debug {
        "info,invocation_agent=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).without_time())
        .with(filter)
        .try_init()?;

    Ok(())
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
