//! Plugin contract.
//!
//! A plugin observes every lifecycle stage of every invocation. Instances are
//! built once per [`Agent`] and shared by all concurrent invocations, so any
//! mutable state a plugin keeps must be synchronised by the plugin itself.

use crate::agent::Agent;
use crate::context::InvocationContext;
use crate::report::Report;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Metadata reported for each plugin on every report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PluginMeta {
    pub name: String,
    pub version: String,
    pub homepage: String,
    pub enabled: bool,
    pub uploads: Vec<String>,
}

impl PluginMeta {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            enabled: true,
            ..Default::default()
        }
    }

    pub fn homepage(mut self, homepage: impl Into<String>) -> Self {
        self.homepage = homepage.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn upload(mut self, url: impl Into<String>) -> Self {
        self.uploads.push(url.into());
        self
    }
}

/// Lifecycle observer.
///
/// Every callback defaults to doing nothing. Callbacks for one stage run
/// concurrently across plugins, with no ordering between them.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn meta(&self) -> PluginMeta;

    /// Reported in the plugin's metadata. Callbacks are delivered regardless,
    /// so a plugin that can be switched off checks this itself.
    fn enabled(&self) -> bool {
        self.meta().enabled
    }

    async fn pre_setup(&self, _agent: &Agent) {}

    async fn post_setup(&self, _agent: &Agent) {}

    async fn pre_invoke(&self, _context: &InvocationContext, _payload: &Value) {}

    async fn post_invoke(&self, _context: &InvocationContext, _payload: &Value) {}

    async fn pre_report(&self, _report: &Report) {}

    async fn post_report(&self, _report: &Report) {}
}

/// Builds a plugin instance when an agent is constructed.
pub type PluginFactory = Box<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;
