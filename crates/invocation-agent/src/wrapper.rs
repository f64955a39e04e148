//! Lifecycle of a single instrumented invocation.
//!
//! The handler and a deadline watcher race. Whichever reaches a terminal
//! state first runs the reporting sequence; the other finds it already done.

use crate::agent::Agent;
use crate::context::InvocationContext;
use crate::error::HandlerError;
use crate::handler::Adapter;
use crate::hook::{HookEvent, run_hook};
use crate::panic::{CatchPanic, InvocationError};
use crate::report::InvocationReport;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) const TIMEOUT_MESSAGE: &str = "timeout exceeded";
pub(crate) const TIMEOUT_NAME: &str = "TimeoutError";

/// Terminal-state guard shared by the handler path and the watcher.
struct Completion {
    agent: Agent,
    report: Arc<InvocationReport>,
    context: InvocationContext,
    payload: Arc<Value>,
    completed: AtomicBool,
}

impl Completion {
    /// Runs post-invoke through post-report. Only the first caller does
    /// anything; returns whether this call was that caller.
    async fn complete(&self, error: Option<InvocationError>) -> bool {
        if self.completed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let plugins = self.agent.plugins();
        run_hook(
            plugins,
            HookEvent::PostInvoke(self.context.clone(), Arc::clone(&self.payload)),
        )
        .await;

        let report = self.report.prepare(error);
        run_hook(plugins, HookEvent::PreReport(Arc::clone(&report))).await;
        self.report.send().await;
        run_hook(plugins, HookEvent::PostReport(report)).await;
        true
    }
}

/// Runs `adapter` under full instrumentation.
///
/// Returns whatever the handler returned. A handler panic is reported and
/// then resumed on the calling task.
pub(crate) async fn run<R>(
    agent: &Agent,
    adapter: &Adapter<R>,
    lambda: lambda_runtime::Context,
    payload: Value,
) -> Result<R, HandlerError>
where
    R: Send + 'static,
{
    let deadline = lambda.deadline;
    let report = Arc::new(InvocationReport::new(agent.clone(), &lambda));
    let token = CancellationToken::new();
    let context = InvocationContext::new(lambda, Arc::clone(&report), token.clone());
    let payload = Arc::new(payload);

    run_hook(
        agent.plugins(),
        HookEvent::PreInvoke(context.clone(), Arc::clone(&payload)),
    )
    .await;

    let completion = Arc::new(Completion {
        agent: agent.clone(),
        report,
        context: context.clone(),
        payload: Arc::clone(&payload),
        completed: AtomicBool::new(false),
    });

    let watcher = tokio::spawn(watch_deadline(
        Arc::clone(&completion),
        deadline,
        agent.timeout_window(),
        token.clone(),
    ));

    let outcome = CatchPanic::new(adapter.invoke(context, payload)).await;
    token.cancel();

    let error = match &outcome {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(InvocationError::new(e.to_string(), e.name())),
        Err(caught) => Some(caught.to_invocation_error(0)),
    };

    if !completion.complete(error).await {
        debug!("Invocation already reported");
    }

    if let Err(e) = watcher.await {
        warn!(error = %e, "Deadline watcher failed");
    }

    agent.process_state().clear_cold_start();

    match outcome {
        Ok(result) => result,
        Err(caught) => caught.resume(),
    }
}

/// Time until the watch point, or `None` when no watch should happen.
fn watch_delay(deadline_ms: u64, window: Duration, now: SystemTime) -> Option<Duration> {
    if deadline_ms == 0 {
        return None;
    }
    let watch_point = (UNIX_EPOCH + Duration::from_millis(deadline_ms)).checked_sub(window)?;
    watch_point.duration_since(now).ok().filter(|d| !d.is_zero())
}

async fn watch_deadline(
    completion: Arc<Completion>,
    deadline_ms: u64,
    window: Duration,
    token: CancellationToken,
) {
    let Some(delay) = watch_delay(deadline_ms, window, SystemTime::now()) else {
        debug!(deadline_ms, "Deadline watch disabled");
        return;
    };

    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(delay) => {
            if completion
                .complete(Some(InvocationError::new(TIMEOUT_MESSAGE, TIMEOUT_NAME)))
                .await
            {
                warn!(
                    request_id = %completion.context.request_id(),
                    "Invocation approaching deadline, reported as timed out"
                );
            }
        }
    }
}
