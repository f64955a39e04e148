//! The agent and the handlers it decorates.

use crate::config::AgentConfig;
use crate::context::InvocationContext;
use crate::error::{BoxError, HandlerError, HandlerShapeError, Result};
use crate::handler::{Adapter, BoxFuture, IntoHandler};
use crate::hook::{HookEvent, run_hook};
use crate::plugin::{Plugin, PluginFactory};
use crate::process::ProcessState;
use crate::report::{LogReporter, Reporter};
use crate::system::{ProcSystemReader, SystemReader};
use crate::wrapper;
use lambda_runtime::LambdaEvent;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;
use tracing::{Instrument, debug, info_span};

/// Shared instrumentation settings and collaborators.
///
/// Cheap to clone. Read-only once built, so one agent can decorate any
/// number of handlers serving concurrent invocations.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    plugins: Vec<Arc<dyn Plugin>>,
    reporter: Arc<dyn Reporter>,
    system: Arc<dyn SystemReader>,
    process: Option<Arc<ProcessState>>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Builds an agent from [`AgentConfig::load`] with default collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be parsed.
    pub async fn from_env() -> Result<Self> {
        let config = AgentConfig::load()?;
        Ok(Self::builder().config(config).build().await)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn token(&self) -> &str {
        &self.inner.config.token
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    pub fn debug(&self) -> bool {
        self.inner.config.debug
    }

    pub fn timeout_window(&self) -> Duration {
        self.inner.config.timeout_window
    }

    /// True when decorated handlers will be instrumented: the agent is
    /// enabled and has a non-empty token.
    pub fn is_instrumenting(&self) -> bool {
        self.inner.config.is_instrumenting()
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.inner.plugins
    }

    pub fn reporter(&self) -> &dyn Reporter {
        self.inner.reporter.as_ref()
    }

    pub fn system_reader(&self) -> &dyn SystemReader {
        self.inner.system.as_ref()
    }

    /// Process-wide state; the global instance unless one was injected.
    pub fn process_state(&self) -> &ProcessState {
        self.inner
            .process
            .as_deref()
            .unwrap_or_else(|| ProcessState::global())
    }

    /// Adapts `handler` and, when instrumenting, wraps it in the invocation
    /// lifecycle.
    ///
    /// The handler's shape is validated either way, so an unusable handler
    /// is rejected here rather than on its first invocation.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerShapeError`] if the handler cannot be adapted.
    pub fn decorate<H, M>(
        &self,
        handler: H,
    ) -> std::result::Result<DecoratedHandler<H::Response>, HandlerShapeError>
    where
        H: IntoHandler<M>,
    {
        let adapter = Adapter::new(handler)?;
        let instrumented = self.is_instrumenting();
        debug!(instrumented, shape = ?adapter.shape(), "Decorated handler");

        Ok(if instrumented {
            DecoratedHandler::Instrumented {
                agent: self.clone(),
                adapter,
            }
        } else {
            DecoratedHandler::Passthrough(adapter)
        })
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("enabled", &self.is_enabled())
            .field("has_token", &!self.token().is_empty())
            .field("timeout_window", &self.timeout_window())
            .field("plugins", &self.inner.plugins.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Agent`].
#[must_use = "builders do nothing unless .build() is called"]
pub struct AgentBuilder {
    config: AgentConfig,
    plugins: Vec<Arc<dyn Plugin>>,
    factories: Vec<PluginFactory>,
    reporter: Option<Arc<dyn Reporter>>,
    system: Option<Arc<dyn SystemReader>>,
    process: Option<Arc<ProcessState>>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
            plugins: Vec::new(),
            factories: Vec::new(),
            reporter: None,
            system: None,
            process: None,
        }
    }

    /// Replaces all scalar settings.
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
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

    pub fn plugin(mut self, plugin: impl Plugin) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Registers a factory called once during [`build`](Self::build).
    pub fn plugin_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
        self
    }

    pub fn reporter(self, reporter: impl Reporter) -> Self {
        self.reporter_arc(Arc::new(reporter))
    }

    pub fn reporter_arc(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn system_reader(mut self, reader: impl SystemReader + 'static) -> Self {
        self.system = Some(Arc::new(reader));
        self
    }

    /// Uses `state` instead of the process-wide global.
    pub fn process_state(mut self, state: Arc<ProcessState>) -> Self {
        self.process = Some(state);
        self
    }

    /// Instantiates plugins and runs the `pre:setup` and `post:setup` hooks.
    pub async fn build(self) -> Agent {
        let mut plugins = self.plugins;
        plugins.extend(self.factories.iter().map(|factory| factory()));

        let agent = Agent {
            inner: Arc::new(AgentInner {
                config: self.config,
                plugins,
                reporter: self.reporter.unwrap_or_else(|| Arc::new(LogReporter)),
                system: self
                    .system
                    .unwrap_or_else(|| Arc::new(ProcSystemReader::new())),
                process: self.process,
            }),
        };

        run_hook(agent.plugins(), HookEvent::PreSetup(agent.clone())).await;
        run_hook(agent.plugins(), HookEvent::PostSetup(agent.clone())).await;

        debug!(agent = ?agent, "Agent ready");
        agent
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A handler returned by [`Agent::decorate`].
///
/// Implements [`tower::Service`] over [`LambdaEvent<Value>`], so it can be
/// handed directly to `lambda_runtime::run`.
pub enum DecoratedHandler<R> {
    /// Calls the handler with no instrumentation.
    Passthrough(Adapter<R>),
    /// Runs the full invocation lifecycle around the handler.
    Instrumented { agent: Agent, adapter: Adapter<R> },
}

impl<R> Clone for DecoratedHandler<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Passthrough(adapter) => Self::Passthrough(adapter.clone()),
            Self::Instrumented { agent, adapter } => Self::Instrumented {
                agent: agent.clone(),
                adapter: adapter.clone(),
            },
        }
    }
}

impl<R: Send + 'static> DecoratedHandler<R> {
    pub fn is_instrumented(&self) -> bool {
        matches!(self, Self::Instrumented { .. })
    }

    /// Runs one invocation.
    ///
    /// The handler's own response or error is returned unchanged. A handler
    /// panic propagates after it has been reported.
    pub async fn invoke(
        &self,
        context: lambda_runtime::Context,
        payload: Value,
    ) -> std::result::Result<R, BoxError> {
        match self {
            Self::Passthrough(adapter) => adapter
                .invoke(InvocationContext::detached(context), Arc::new(payload))
                .await
                .map_err(HandlerError::into_inner),
            Self::Instrumented { agent, adapter } => {
                let span = info_span!("invocation", request_id = %context.request_id);
                wrapper::run(agent, adapter, context, payload)
                    .instrument(span)
                    .await
                    .map_err(HandlerError::into_inner)
            }
        }
    }
}

impl<R> fmt::Debug for DecoratedHandler<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passthrough(adapter) => f.debug_tuple("Passthrough").field(adapter).finish(),
            Self::Instrumented { agent, adapter } => f
                .debug_struct("Instrumented")
                .field("agent", agent)
                .field("adapter", adapter)
                .finish(),
        }
    }
}

impl<R: Send + 'static> Service<LambdaEvent<Value>> for DecoratedHandler<R> {
    type Response = R;
    type Error = BoxError;
    type Future = BoxFuture<std::result::Result<R, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LambdaEvent<Value>) -> Self::Future {
        let (payload, context) = event.into_parts();
        let handler = self.clone();
        Box::pin(async move { handler.invoke(context, payload).await })
    }
}
