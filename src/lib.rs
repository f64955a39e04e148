//! Invocation agent workspace - end-to-end tests against a mock Lambda Runtime API.
//!
//! This is a virtual package that provides workspace-level integration tests.
//! The actual functionality is provided by the workspace member crates:
//!
//! - `invocation-agent`: Decorates Lambda handlers and builds one report per invocation
//! - `invocation-collector`: Delivers reports to the collector API and signs plugin uploads
