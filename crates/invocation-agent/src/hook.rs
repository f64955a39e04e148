//! Concurrent dispatch of lifecycle hooks to plugins.

use crate::agent::Agent;
use crate::context::InvocationContext;
use crate::plugin::Plugin;
use crate::report::Report;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Lifecycle stage a plugin callback is attached to.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    PreSetup,
    PostSetup,
    PreInvoke,
    PostInvoke,
    PreReport,
    PostReport,
}

impl Hook {
    pub const ALL: [Hook; 6] = [
        Hook::PreSetup,
        Hook::PostSetup,
        Hook::PreInvoke,
        Hook::PostInvoke,
        Hook::PreReport,
        Hook::PostReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::PreSetup => "pre:setup",
            Hook::PostSetup => "post:setup",
            Hook::PreInvoke => "pre:invoke",
            Hook::PostInvoke => "post:invoke",
            Hook::PreReport => "pre:report",
            Hook::PostReport => "post:report",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hook stage together with the arguments its callbacks receive.
#[derive(Clone)]
pub(crate) enum HookEvent {
    PreSetup(Agent),
    PostSetup(Agent),
    PreInvoke(InvocationContext, Arc<Value>),
    PostInvoke(InvocationContext, Arc<Value>),
    PreReport(Arc<Report>),
    PostReport(Arc<Report>),
}

impl HookEvent {
    pub(crate) fn hook(&self) -> Hook {
        match self {
            HookEvent::PreSetup(_) => Hook::PreSetup,
            HookEvent::PostSetup(_) => Hook::PostSetup,
            HookEvent::PreInvoke(..) => Hook::PreInvoke,
            HookEvent::PostInvoke(..) => Hook::PostInvoke,
            HookEvent::PreReport(_) => Hook::PreReport,
            HookEvent::PostReport(_) => Hook::PostReport,
        }
    }

    async fn dispatch(&self, plugin: &dyn Plugin) {
        match self {
            HookEvent::PreSetup(agent) => plugin.pre_setup(agent).await,
            HookEvent::PostSetup(agent) => plugin.post_setup(agent).await,
            HookEvent::PreInvoke(ctx, payload) => plugin.pre_invoke(ctx, payload).await,
            HookEvent::PostInvoke(ctx, payload) => plugin.post_invoke(ctx, payload).await,
            HookEvent::PreReport(report) => plugin.pre_report(report).await,
            HookEvent::PostReport(report) => plugin.post_report(report).await,
        }
    }
}

/// Runs one stage on every plugin and waits for all of them.
///
/// Plugins are called whether or not they report themselves enabled; acting
/// on the flag is up to each plugin. Each callback runs as its own task. A callback that panics is logged
/// against its plugin and does not affect the others or the barrier.
pub(crate) async fn run_hook(plugins: &[Arc<dyn Plugin>], event: HookEvent) {
    let hook = event.hook();
    let mut tasks = JoinSet::new();
    let mut names = HashMap::new();

    for plugin in plugins {
        let name = plugin.meta().name;
        let plugin = Arc::clone(plugin);
        let event = event.clone();
        let handle = tasks.spawn(async move {
            event.dispatch(plugin.as_ref()).await;
        });
        names.insert(handle.id(), name);
    }

    if tasks.is_empty() {
        return;
    }

    debug!(hook = %hook, plugins = tasks.len(), "Running hook");

    while let Some(result) = tasks.join_next_with_id().await {
        if let Err(e) = result {
            let plugin = names.get(&e.id()).map(String::as_str).unwrap_or("unknown");
            error!(hook = %hook, plugin, error = %e, "Plugin hook failed");
        }
    }
}
