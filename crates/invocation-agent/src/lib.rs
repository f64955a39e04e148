//! Invocation telemetry for AWS Lambda handlers.
//!
//! An [`Agent`] decorates a handler so that every invocation produces one
//! [`Report`]: timing, platform and host details, labels and custom metrics
//! recorded by the handler, and any error or panic the handler raised. The
//! handler's own response is always returned unchanged.
//!
//! # Usage
//!
//! ```no_run
//! use invocation_agent::{Agent, InvocationContext};
//! use lambda_runtime::Error;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Order {
//!     id: String,
//!     items: u32,
//! }
//!
//! async fn handle(ctx: InvocationContext, order: Order) -> Result<String, Error> {
//!     ctx.label("orders");
//!     ctx.metric("items", order.items);
//!     Ok(order.id)
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let agent = Agent::from_env().await?;
//!     let handler = agent.decorate(handle)?;
//!     lambda_runtime::run(handler).await
//! }
//! ```
//!
//! # Lifecycle
//!
//! Each instrumented invocation runs the `pre:invoke` hook, then the handler.
//! A watcher races it and reports the invocation as timed out once the
//! deadline is within [`AgentConfig::timeout_window`]. Whichever finishes
//! first runs `post:invoke`, finalises the report, runs `pre:report`, sends
//! it, and runs `post:report`. The report is sent at most once.
//!
//! A handler panic is recorded with its stack trace and then resumed, so the
//! runtime observes it exactly as it would without the agent.
//!
//! # Pass-through
//!
//! When the agent is disabled or has no token, decorated handlers are called
//! directly: no hooks, no report.
//!
//! # Features
//!
//! - `test-utils` - recording reporter and plugin, and a Lambda context
//!   constructor, for tests of code built on this crate

mod agent;
mod config;
mod context;
mod error;
mod handler;
mod hook;
mod panic;
mod plugin;
mod process;
mod report;
mod system;
mod wrapper;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use agent::{Agent, AgentBuilder, DecoratedHandler};
pub use config::{AgentConfig, ConfigBuilder, DEFAULT_TIMEOUT_WINDOW, init_tracing};
pub use context::InvocationContext;
pub use error::{AgentError, BoxError, HandlerError, HandlerShapeError, Result};
pub use handler::{
    Adapter, BoxFuture, HandlerKind, HandlerOutput, HandlerParam, HandlerShape, IntoHandler,
    Nullable, Param, Raw, RawHandler, Return,
};
pub use hook::Hook;
pub use panic::{CatchPanic, CaughtPanic, InvocationError, StackFrame, type_name_of};
pub use plugin::{Plugin, PluginFactory, PluginMeta};
pub use process::ProcessState;
pub use report::{
    AGENT_RUNTIME, AGENT_VERSION, AgentDetails, AwsDetails, CpuInfo, CustomMetric, Environment,
    FnReporter, HostDetails, INSTALL_METHOD, InvocationReport, LinuxDetails, LogReporter,
    MAX_NAME_LENGTH, OsDetails, PidDetails, ProcessDetails, Report, ReportError, Reporter,
    RuntimeDetails,
};
pub use system::{
    CpuTimes, DiskStats, MemoryStats, ProcStat, ProcStatus, ProcSystemReader, SystemReader,
    SystemSnapshot,
};
