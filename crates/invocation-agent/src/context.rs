//! Per-invocation context handed to handlers and plugins.

use crate::panic::InvocationError;
use crate::report::InvocationReport;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// The platform's invocation context plus access to the invocation's report.
///
/// Dereferences to [`lambda_runtime::Context`]. Cloning is cheap and every
/// clone refers to the same invocation.
///
/// A handler receives this by declaring it as its first parameter:
///
/// ```no_run
/// use invocation_agent::{Agent, InvocationContext};
///
/// # async fn example(agent: Agent) -> Result<(), invocation_agent::AgentError> {
/// let handler = agent.decorate(|ctx: InvocationContext, name: String| async move {
///     ctx.label("greeting");
///     ctx.metric("name_length", name.len());
///     Ok::<_, lambda_runtime::Error>(format!("Hello {name}"))
/// })?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InvocationContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    lambda: lambda_runtime::Context,
    report: Option<Arc<InvocationReport>>,
    cancellation: CancellationToken,
}

impl InvocationContext {
    pub(crate) fn new(
        lambda: lambda_runtime::Context,
        report: Arc<InvocationReport>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                lambda,
                report: Some(report),
                cancellation,
            }),
        }
    }

    /// A context with no report behind it. Labels, metrics and errors
    /// recorded on it are discarded.
    pub(crate) fn detached(lambda: lambda_runtime::Context) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                lambda,
                report: None,
                cancellation: CancellationToken::new(),
            }),
        }
    }

    pub fn lambda_context(&self) -> &lambda_runtime::Context {
        &self.inner.lambda
    }

    pub fn request_id(&self) -> &str {
        &self.inner.lambda.request_id
    }

    /// Wall-clock deadline of the invocation, if the platform set one.
    pub fn deadline(&self) -> Option<SystemTime> {
        match self.inner.lambda.deadline {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.duration_since(SystemTime::now()).unwrap_or_default())
    }

    /// Token cancelled once the invocation has finished.
    ///
    /// Background work started by the handler can watch it to stop promptly;
    /// the agent never forcibly terminates a running handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    /// Adds a label to the report. Duplicates collapse; names over 128
    /// characters are ignored.
    pub fn label(&self, name: impl Into<String>) {
        if let Some(report) = &self.inner.report {
            report.label(name);
        }
    }

    /// Records a custom metric. Strings and numbers are kept; other values
    /// are dropped.
    pub fn metric(&self, name: impl Into<String>, value: impl Into<Value>) {
        if let Some(report) = &self.inner.report {
            report.metric(name, value);
        }
    }

    /// Records `err` and sends the report immediately.
    ///
    /// Useful when the handler is about to do something that may never
    /// return. The normal end of the invocation will not send again.
    pub async fn error<E>(&self, err: &E)
    where
        E: fmt::Display + ?Sized + 'static,
    {
        if let Some(report) = &self.inner.report {
            report.prepare(Some(InvocationError::from_error(err)));
            report.send().await;
        }
    }

    pub(crate) fn report(&self) -> Option<&Arc<InvocationReport>> {
        self.inner.report.as_ref()
    }
}

impl Deref for InvocationContext {
    type Target = lambda_runtime::Context;

    fn deref(&self) -> &Self::Target {
        &self.inner.lambda
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("request_id", &self.inner.lambda.request_id)
            .field("deadline", &self.inner.lambda.deadline)
            .field("report", &self.inner.report)
            .finish()
    }
}

/// Contexts are supplied by the agent and never decoded from a payload.
///
/// The impl exists so a context can sit in the same parameter position as a
/// payload type; decoding always fails.
impl<'de> Deserialize<'de> for InvocationContext {
    fn deserialize<D>(_deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Err(serde::de::Error::custom(
            "an invocation context cannot be decoded from a payload",
        ))
    }
}
