//! Integration test harness that runs the whole stack together:
//! - A mock Lambda Runtime API serving queued events
//! - `lambda_runtime::run` driving a decorated handler
//! - The collector reporter posting to a mock collector
//!
//! Reports are asserted in the wire format the collector receives.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use invocation_agent::{Agent, InvocationContext};
use invocation_collector::{CollectorConfig, CollectorReporter};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use serial_test::serial;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use temp_env::async_with_vars;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

const FUNCTION_ARN: &str = "arn:aws:lambda:eu-west-1:123456789012:function:harness-function";

struct QueuedEvent {
    request_id: String,
    deadline_ms: u64,
    payload: Value,
}

#[derive(Clone, Default)]
struct MockState {
    queue: Arc<Mutex<VecDeque<QueuedEvent>>>,
    responses: Arc<Mutex<Vec<(String, Value)>>>,
    errors: Arc<Mutex<Vec<(String, Value)>>>,
    reports: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

impl MockState {
    fn enqueue(&self, request_id: &str, deadline_ms: u64, payload: Value) {
        self.queue.lock().push_back(QueuedEvent {
            request_id: request_id.to_string(),
            deadline_ms,
            payload,
        });
    }

    fn settled(&self) -> usize {
        self.responses.lock().len() + self.errors.lock().len()
    }

    fn response(&self, request_id: &str) -> Option<Value> {
        find(&self.responses.lock(), request_id)
    }

    fn error(&self, request_id: &str) -> Option<Value> {
        find(&self.errors.lock(), request_id)
    }

    fn report(&self, request_id: &str) -> Option<(Option<String>, Value)> {
        self.reports
            .lock()
            .iter()
            .find(|(_, body)| body["aws"]["awsRequestId"] == request_id)
            .cloned()
    }
}

fn find(entries: &[(String, Value)], request_id: &str) -> Option<Value> {
    entries
        .iter()
        .find(|(id, _)| id == request_id)
        .map(|(_, body)| body.clone())
}

/// GET /2018-06-01/runtime/invocation/next
///
/// Long-polls forever once the queue is drained, like the real endpoint does
/// between invocations.
async fn next_invocation(State(state): State<MockState>) -> Response {
    let next = state.queue.lock().pop_front();
    let Some(event) = next else {
        return std::future::pending::<Response>().await;
    };

    let mut headers = HeaderMap::new();
    let pairs = [
        ("lambda-runtime-aws-request-id", event.request_id),
        ("lambda-runtime-deadline-ms", event.deadline_ms.to_string()),
        ("lambda-runtime-invoked-function-arn", FUNCTION_ARN.to_string()),
        (
            "lambda-runtime-trace-id",
            "Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8;Sampled=1"
                .to_string(),
        ),
    ];
    for (name, value) in pairs {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    (StatusCode::OK, headers, Json(event.payload)).into_response()
}

/// POST /2018-06-01/runtime/invocation/{request_id}/response
async fn invocation_response(
    State(state): State<MockState>,
    Path(request_id): Path<String>,
    body: String,
) -> StatusCode {
    let value = serde_json::from_str(&body).unwrap_or(Value::String(body));
    state.responses.lock().push((request_id, value));
    StatusCode::ACCEPTED
}

/// POST /2018-06-01/runtime/invocation/{request_id}/error
async fn invocation_error(
    State(state): State<MockState>,
    Path(request_id): Path<String>,
    body: String,
) -> StatusCode {
    let value = serde_json::from_str(&body).unwrap_or(Value::String(body));
    state.errors.lock().push((request_id, value));
    StatusCode::ACCEPTED
}

/// POST /v0/event
async fn collect(State(state): State<MockState>, headers: HeaderMap, Json(body): Json<Value>) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.reports.lock().push((auth, body));
}

async fn start_mock() -> (SocketAddr, MockState) {
    let state = MockState::default();
    let router = Router::new()
        .route("/2018-06-01/runtime/invocation/next", get(next_invocation))
        .route(
            "/2018-06-01/runtime/invocation/{request_id}/response",
            post(invocation_response),
        )
        .route(
            "/2018-06-01/runtime/invocation/{request_id}/error",
            post(invocation_error),
        )
        .route("/v0/event", post(collect))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

fn deadline_in(ms: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    now + ms
}

#[derive(Debug, Deserialize)]
struct Command {
    action: String,
    #[serde(default)]
    delay_ms: u64,
}

#[derive(Debug)]
struct OutOfStock;

impl std::fmt::Display for OutOfStock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "out of stock")
    }
}

impl std::error::Error for OutOfStock {}

async fn handle(ctx: InvocationContext, command: Command) -> Result<String, OutOfStock> {
    ctx.label("harness");
    match command.action.as_str() {
        "ok" => {
            ctx.metric("items", json!(3));
            Ok("done".to_string())
        }
        "fail" => Err(OutOfStock),
        "panic" => panic!("handler exploded"),
        "sleep" => {
            sleep(Duration::from_millis(command.delay_ms)).await;
            Ok("late".to_string())
        }
        other => Ok(format!("unknown action {other}")),
    }
}

/// Runs `lambda_runtime::run` with a decorated [`handle`] until `expected`
/// invocations have settled and been reported.
async fn run_invocations(addr: SocketAddr, state: &MockState, expected: usize) {
    let reporter = CollectorReporter::new(&CollectorConfig {
        url: Some(format!("http://{addr}")),
        timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .unwrap();

    let agent = Agent::builder()
        .token("harness-token")
        .timeout_window(Duration::from_millis(150))
        .reporter(reporter)
        .build()
        .await;
    let handler = agent.decorate(handle).unwrap();
    assert!(handler.is_instrumented());

    let runtime_api = addr.to_string();
    let vars = [
        ("AWS_LAMBDA_RUNTIME_API", Some(runtime_api.as_str())),
        ("AWS_LAMBDA_FUNCTION_NAME", Some("harness-function")),
        ("AWS_LAMBDA_FUNCTION_VERSION", Some("$LATEST")),
        ("AWS_LAMBDA_FUNCTION_MEMORY_SIZE", Some("256")),
        ("AWS_LAMBDA_LOG_GROUP_NAME", Some("/aws/lambda/harness-function")),
        ("AWS_LAMBDA_LOG_STREAM_NAME", Some("2026/10/18/[$LATEST]abc")),
    ];

    async_with_vars(vars, async {
        let wait = async {
            loop {
                if state.settled() >= expected && state.reports.lock().len() >= expected {
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        };

        tokio::select! {
            result = lambda_runtime::run(handler) => {
                panic!("runtime loop exited early: {result:?}");
            }
            waited = timeout(Duration::from_secs(10), wait) => {
                waited.expect("invocations did not settle in time");
            }
        }
    })
    .await;
}

#[tokio::test]
#[serial]
async fn test_successful_invocation_end_to_end() {
    let (addr, state) = start_mock().await;
    state.enqueue("req-ok", deadline_in(30_000), json!({ "action": "ok" }));

    run_invocations(addr, &state, 1).await;

    assert_eq!(state.response("req-ok"), Some(json!("done")));
    assert!(state.error("req-ok").is_none());

    let (auth, report) = state.report("req-ok").unwrap();
    assert_eq!(auth.as_deref(), Some("harness-token"));
    assert_eq!(report["client_id"], "harness-token");
    assert_eq!(report["errors"], json!({}));
    assert_eq!(report["labels"], json!(["harness"]));
    assert_eq!(
        report["custom_metrics"],
        json!([{ "name": "items", "s": null, "n": 3 }])
    );

    let aws = &report["aws"];
    assert_eq!(aws["functionName"], "harness-function");
    assert_eq!(aws["functionVersion"], "$LATEST");
    assert_eq!(aws["invokedFunctionArn"], FUNCTION_ARN);
    assert_eq!(aws["memoryLimitInMB"], 256);
    assert_eq!(aws["logGroupName"], "/aws/lambda/harness-function");
    assert!(aws["getRemainingTimeInMillis"].as_i64().unwrap() > 0);
    assert!(report["timestampEnd"].as_i64().unwrap() >= report["timestamp"].as_i64().unwrap());
}

#[tokio::test]
#[serial]
async fn test_handler_error_reaches_runtime_and_report() {
    let (addr, state) = start_mock().await;
    state.enqueue("req-fail", deadline_in(30_000), json!({ "action": "fail" }));

    run_invocations(addr, &state, 1).await;

    assert!(state.response("req-fail").is_none());
    let diagnostic = state.error("req-fail").unwrap();
    assert_eq!(diagnostic["errorMessage"], "out of stock");

    let (_, report) = state.report("req-fail").unwrap();
    assert_eq!(report["errors"]["message"], "out of stock");
    assert_eq!(report["errors"]["name"], "OutOfStock");
}

#[tokio::test]
#[serial]
async fn test_panic_is_reported_before_runtime_sees_it() {
    let (addr, state) = start_mock().await;
    state.enqueue("req-panic", deadline_in(30_000), json!({ "action": "panic" }));

    run_invocations(addr, &state, 1).await;

    assert!(state.response("req-panic").is_none());
    assert!(state.error("req-panic").is_some());

    let (_, report) = state.report("req-panic").unwrap();
    assert_eq!(report["errors"]["message"], "handler exploded");
    assert_eq!(report["errors"]["name"], "str");
    assert!(!report["errors"]["stack"].as_str().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_timeout_reported_while_handler_still_runs() {
    let (addr, state) = start_mock().await;
    state.enqueue(
        "req-slow",
        deadline_in(400),
        json!({ "action": "sleep", "delay_ms": 600 }),
    );

    run_invocations(addr, &state, 1).await;

    assert_eq!(state.response("req-slow"), Some(json!("late")));

    let reports = state.reports.lock().clone();
    assert_eq!(reports.len(), 1);
    let report = &reports[0].1;
    assert_eq!(report["errors"]["message"], "timeout exceeded");
    assert_eq!(report["errors"]["name"], "TimeoutError");
}

#[tokio::test]
#[serial]
async fn test_sequential_invocations_share_process() {
    let (addr, state) = start_mock().await;
    state.enqueue("req-1", deadline_in(30_000), json!({ "action": "ok" }));
    state.enqueue("req-2", deadline_in(30_000), json!({ "action": "fail" }));
    state.enqueue("req-3", deadline_in(30_000), json!({ "action": "ok" }));

    run_invocations(addr, &state, 3).await;

    let first = state.report("req-1").unwrap().1;
    let second = state.report("req-2").unwrap().1;
    let third = state.report("req-3").unwrap().1;

    assert_eq!(first["processId"], third["processId"]);
    assert_eq!(second["processId"], third["processId"]);
    assert_eq!(third["coldstart"], false);
    assert_eq!(second["coldstart"], false);
    assert_eq!(state.response("req-3"), Some(json!("done")));
}
