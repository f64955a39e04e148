//! Helpers for exercising decorated handlers in tests.
//!
//! Enabled for this crate's own tests and, for dependents, through the
//! `test-utils` feature.

use crate::agent::Agent;
use crate::context::InvocationContext;
use crate::plugin::{Plugin, PluginMeta};
use crate::report::{Report, ReportError, Reporter};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Reporter that keeps every report it is given.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<Report>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    async fn send(&self, report: &Report) -> Result<(), ReportError> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

/// Plugin that records the name of each hook it receives, in order.
///
/// Clones share the same log.
#[derive(Debug, Clone)]
pub struct RecordingPlugin {
    name: String,
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn record(&self, hook: &'static str) {
        self.calls.lock().push(hook);
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn meta(&self) -> PluginMeta {
        PluginMeta::new(self.name.clone(), "0.0.0")
    }

    async fn pre_setup(&self, _agent: &Agent) {
        self.record("pre:setup");
    }

    async fn post_setup(&self, _agent: &Agent) {
        self.record("post:setup");
    }

    async fn pre_invoke(&self, _context: &InvocationContext, _payload: &Value) {
        self.record("pre:invoke");
    }

    async fn post_invoke(&self, _context: &InvocationContext, _payload: &Value) {
        self.record("post:invoke");
    }

    async fn pre_report(&self, _report: &Report) {
        self.record("pre:report");
    }

    async fn post_report(&self, _report: &Report) {
        self.record("post:report");
    }
}

/// A platform context for function `test-function` with 128 MB of memory.
///
/// `deadline_ms` is Unix milliseconds; zero means no deadline.
pub fn lambda_context(request_id: &str, deadline_ms: u64) -> lambda_runtime::Context {
    let mut config = lambda_runtime::Config::default();
    config.function_name = "test-function".to_string();
    config.version = "$LATEST".to_string();
    config.memory = 128;
    config.log_group = "/aws/lambda/test-function".to_string();
    config.log_stream = "2024/01/01/[$LATEST]0123456789abcdef".to_string();

    let mut context = lambda_runtime::Context::default();
    context.request_id = request_id.to_string();
    context.deadline = deadline_ms;
    context.invoked_function_arn =
        "arn:aws:lambda:us-east-1:123456789012:function:test-function".to_string();
    context.env_config = Arc::new(config);
    context
}

/// Unix milliseconds `ms` from now.
pub fn deadline_in(ms: u64) -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default() + ms
}
