//! Process-wide identity and cold start tracking.
//!
//! One [`ProcessState`] exists per execution environment. It is created on
//! first use and shared by every agent in the process; tests can hand an agent
//! a private instance instead.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

static GLOBAL: OnceLock<ProcessState> = OnceLock::new();

/// Identity of this process and whether it has completed an invocation yet.
#[derive(Debug)]
pub struct ProcessState {
    process_id: String,
    load_time: i64,
    cold_start: AtomicBool,
}

impl ProcessState {
    /// Creates fresh state: a new random process id, load time of now, and
    /// the cold start flag set.
    ///
    /// If `AWS_LAMBDA_INITIALIZATION_TYPE` is `provisioned-concurrency` the
    /// environment was pre-warmed and the flag starts cleared.
    pub fn new() -> Self {
        let provisioned = std::env::var("AWS_LAMBDA_INITIALIZATION_TYPE")
            .map(|v| v == "provisioned-concurrency")
            .unwrap_or(false);

        Self {
            process_id: Uuid::new_v4().to_string(),
            load_time: chrono::Utc::now().timestamp_millis(),
            cold_start: AtomicBool::new(!provisioned),
        }
    }

    /// The state shared by the whole process.
    pub fn global() -> &'static ProcessState {
        GLOBAL.get_or_init(ProcessState::new)
    }

    /// Random v4 UUID identifying this process.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Unix time in milliseconds at which this state was created.
    pub fn load_time(&self) -> i64 {
        self.load_time
    }

    pub fn is_cold_start(&self) -> bool {
        self.cold_start.load(Ordering::SeqCst)
    }

    /// Marks the process as warm. Only ever moves true to false.
    pub fn clear_cold_start(&self) {
        self.cold_start.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn reset_for_testing(&self) {
        self.cold_start.store(true, Ordering::SeqCst);
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new()
    }
}
