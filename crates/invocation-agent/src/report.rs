//! Invocation report model.
//!
//! A [`Report`] is the wire record sent to the collector. An
//! [`InvocationReport`] owns the report for one invocation while it is being
//! built: handler code adds labels and metrics through the invocation context,
//! the lifecycle finalises it once with [`InvocationReport::prepare`], and
//! [`InvocationReport::send`] hands it to the [`Reporter`] at most once.

use crate::agent::Agent;
use crate::panic::InvocationError;
use crate::plugin::PluginMeta;
use crate::system::{CpuTimes, DiskStats, ProcStat, ProcStatus, SystemSnapshot};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Number, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const INSTALL_METHOD: &str = "manual";
pub const AGENT_RUNTIME: &str = "rust";
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Longest label or metric name that will be recorded.
pub const MAX_NAME_LENGTH: usize = 128;

const MISSING_REQUEST_ID: &str = "ERROR";
const TRACE_ID_ENV: &str = "_X_AMZN_TRACE_ID";

/// The record transmitted for one invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub client_id: String,
    #[serde(rename = "installMethod")]
    pub install_method: String,
    /// Nanoseconds between invocation start and finalisation.
    pub duration: u64,
    #[serde(rename = "processId")]
    pub process_id: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    #[serde(rename = "timestampEnd")]
    pub timestamp_end: i64,
    pub aws: AwsDetails,
    pub environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskStats>,
    pub coldstart: bool,
    #[serde(serialize_with = "serialize_errors")]
    pub errors: Option<InvocationError>,
    pub custom_metrics: Vec<CustomMetric>,
    pub labels: BTreeSet<String>,
    pub plugins: Vec<PluginMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsDetails {
    pub function_name: String,
    pub function_version: String,
    pub aws_request_id: String,
    pub invoked_function_arn: String,
    pub log_group_name: String,
    pub log_stream_name: String,
    #[serde(rename = "memoryLimitInMB")]
    pub memory_limit_in_mb: i32,
    pub get_remaining_time_in_millis: i64,
    pub trace_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Environment {
    pub agent: AgentDetails,
    pub runtime: RuntimeDetails,
    pub host: HostDetails,
    pub os: OsDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentDetails {
    pub runtime: String,
    pub version: String,
    pub load_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeDetails {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostDetails {
    pub boot_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OsDetails {
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totalmem: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freemem: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usedmem: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cpus: Vec<CpuInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<LinuxDetails>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuInfo {
    pub times: CpuTimes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinuxDetails {
    pub pid: PidDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PidDetails {
    #[serde(rename = "self")]
    pub current: ProcessDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessDetails {
    pub stat: Option<ProcStat>,
    pub stat_start: Option<ProcStat>,
    pub status: Option<ProcStatus>,
}

/// A named value recorded by handler code. Exactly one of `s` or `n` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomMetric {
    pub name: String,
    pub s: Option<String>,
    pub n: Option<Number>,
}

impl CustomMetric {
    /// Coerces a value into a metric. Only strings and numbers are kept.
    pub fn new(name: impl Into<String>, value: Value) -> Option<Self> {
        let (s, n) = match value {
            Value::String(s) => (Some(s), None),
            Value::Number(n) => (None, Some(n)),
            _ => return None,
        };
        Some(Self {
            name: name.into(),
            s,
            n,
        })
    }
}

fn serialize_errors<S>(errors: &Option<InvocationError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match errors {
        Some(err) => err.serialize(serializer),
        None => serializer.serialize_map(Some(0))?.end(),
    }
}

impl Environment {
    fn apply_snapshot(&mut self, snapshot: SystemSnapshot, stat_start: Option<ProcStat>) {
        self.host.boot_id = snapshot.boot_id;
        self.os.hostname = snapshot.hostname;

        if let Some(memory) = snapshot.memory {
            self.os.totalmem = Some(memory.total);
            self.os.freemem = Some(memory.free);
            self.os.usedmem = Some(memory.total.saturating_sub(memory.free));
        }

        self.os.cpus = snapshot
            .cpus
            .into_iter()
            .map(|times| CpuInfo { times })
            .collect();

        if snapshot.stat.is_some() || snapshot.status.is_some() || stat_start.is_some() {
            self.os.linux = Some(LinuxDetails {
                pid: PidDetails {
                    current: ProcessDetails {
                        stat: snapshot.stat,
                        stat_start,
                        status: snapshot.status,
                    },
                },
            });
        }
    }
}

/// Errors raised while delivering a report.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ReportError {
    /// The report could not be serialised.
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),

    /// The transport failed before a response was received.
    #[error("report transport failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The collector rejected the report.
    #[error("collector returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl ReportError {
    pub fn transport(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Transport(err.into())
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }
}

/// Delivers finalised reports.
#[async_trait]
pub trait Reporter: Send + Sync + 'static {
    async fn send(&self, report: &Report) -> Result<(), ReportError>;
}

/// Writes each report as JSON to the log. Used when no transport is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn send(&self, report: &Report) -> Result<(), ReportError> {
        let json = serde_json::to_string(report)?;
        info!(target: "invocation_agent::report", request_id = %report.aws.aws_request_id, report = %json, "Invocation report");
        Ok(())
    }
}

/// Adapts an async closure into a [`Reporter`].
pub struct FnReporter<F> {
    f: F,
}

impl<F> FnReporter<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Reporter for FnReporter<F>
where
    F: Fn(Report) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ReportError>> + Send,
{
    async fn send(&self, report: &Report) -> Result<(), ReportError> {
        (self.f)(report.clone()).await
    }
}

struct ReportState {
    report: Report,
    stat_start: Option<ProcStat>,
    prepared: Option<Arc<Report>>,
}

/// The report for one in-flight invocation.
pub struct InvocationReport {
    agent: Agent,
    started: Instant,
    state: Mutex<ReportState>,
    sent: AtomicBool,
}

impl InvocationReport {
    /// Starts a report for an invocation described by `context`.
    pub fn new(agent: Agent, context: &lambda_runtime::Context) -> Self {
        let process = agent.process_state();
        let now = chrono::Utc::now().timestamp_millis();

        let aws_request_id = if context.request_id.is_empty() {
            MISSING_REQUEST_ID.to_string()
        } else {
            context.request_id.clone()
        };

        let remaining = if context.deadline == 0 {
            0
        } else {
            i64::try_from(context.deadline).unwrap_or(i64::MAX) - now
        };

        let trace_id = context
            .xray_trace_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| std::env::var(TRACE_ID_ENV).ok())
            .unwrap_or_default();

        let config = &context.env_config;
        let report = Report {
            client_id: agent.token().to_string(),
            install_method: INSTALL_METHOD.to_string(),
            process_id: process.process_id().to_string(),
            timestamp: now,
            aws: AwsDetails {
                function_name: config.function_name.clone(),
                function_version: config.version.clone(),
                aws_request_id,
                invoked_function_arn: context.invoked_function_arn.clone(),
                log_group_name: config.log_group.clone(),
                log_stream_name: config.log_stream.clone(),
                memory_limit_in_mb: config.memory,
                get_remaining_time_in_millis: remaining,
                trace_id,
            },
            environment: Environment {
                agent: AgentDetails {
                    runtime: AGENT_RUNTIME.to_string(),
                    version: AGENT_VERSION.to_string(),
                    load_time: process.load_time(),
                },
                runtime: RuntimeDetails {
                    name: AGENT_RUNTIME.to_string(),
                    version: env!("CARGO_PKG_RUST_VERSION").to_string(),
                },
                ..Default::default()
            },
            coldstart: process.is_cold_start(),
            ..Default::default()
        };

        let stat_start = agent.system_reader().process_stat();

        Self {
            agent,
            started: Instant::now(),
            state: Mutex::new(ReportState {
                report,
                stat_start,
                prepared: None,
            }),
            sent: AtomicBool::new(false),
        }
    }

    /// Adds a label. Names longer than [`MAX_NAME_LENGTH`] are ignored.
    pub fn label(&self, name: impl Into<String>) {
        let name = name.into();
        if name.chars().count() > MAX_NAME_LENGTH {
            warn!(label = %name, "Label name exceeds {MAX_NAME_LENGTH} characters, ignoring");
            return;
        }
        self.state.lock().report.labels.insert(name);
    }

    /// Records a custom metric.
    ///
    /// String values populate `s`, numeric values populate `n`, anything else
    /// is dropped.
    pub fn metric(&self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        if name.chars().count() > MAX_NAME_LENGTH {
            warn!(metric = %name, "Metric name exceeds {MAX_NAME_LENGTH} characters, ignoring");
            return;
        }
        let Some(metric) = CustomMetric::new(name, value.into()) else {
            return;
        };
        self.state.lock().report.custom_metrics.push(metric);
    }

    /// Finalises the report. Only the first call has any effect; later calls
    /// return the report produced by the first.
    pub fn prepare(&self, error: Option<InvocationError>) -> Arc<Report> {
        let mut state = self.state.lock();
        if let Some(prepared) = &state.prepared {
            return Arc::clone(prepared);
        }

        let duration = u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let snapshot = self.agent.system_reader().snapshot();
        let disk = snapshot.disk;
        let stat_start = state.stat_start;

        let mut report = state.report.clone();
        report.duration = duration;
        report.timestamp_end = chrono::Utc::now().timestamp_millis();
        report.errors = error;
        report.plugins = self.agent.plugins().iter().map(|p| p.meta()).collect();
        report.disk = disk;
        report.environment.apply_snapshot(snapshot, stat_start);

        let prepared = Arc::new(report);
        state.prepared = Some(Arc::clone(&prepared));
        prepared
    }

    /// The finalised report, if [`prepare`](Self::prepare) has run.
    pub fn prepared(&self) -> Option<Arc<Report>> {
        self.state.lock().prepared.clone()
    }

    /// Transmits the report through the agent's reporter.
    ///
    /// At most one call per invocation transmits; it returns `true`. Delivery
    /// failures are logged and never surfaced to the handler's caller.
    pub async fn send(&self) -> bool {
        if self.sent.swap(true, Ordering::SeqCst) {
            debug!("Report already sent, skipping");
            return false;
        }

        let report = self.prepare(None);
        if let Err(e) = self.agent.reporter().send(&report).await {
            warn!(error = %e, request_id = %report.aws.aws_request_id, "Failed to send report");
        }
        true
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for InvocationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationReport")
            .field("sent", &self.is_sent())
            .finish_non_exhaustive()
    }
}
