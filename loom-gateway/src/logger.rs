//! Durable per-invocation execution logs.
//!
//! Logging is best-effort relative to the response: [`ExecutionLogger::spawn`]
//! hands the write to a background task, and failures only reach the
//! operator channel (`tracing` target `loom::operator`).

use std::sync::Arc;

use indexmap::IndexMap;
use loom_core::{
    Clock, ExecutionLogEntry, ExecutionOutcome, RequestSnapshot, RouteId, RouteStore,
};
use loom_executor::ExecutionReport;
use serde_json::Value;
use tokio::task::JoinHandle;

/// Bodies larger than this are cut in the log.
pub const MAX_LOGGED_BODY_BYTES: usize = 64 * 1024;

const REDACTED: &str = "[redacted]";
const TRUNCATED_MARKER: &str = "...[truncated]";
const REDACTED_HEADERS: [&str; 2] = ["authorization", "cookie"];

/// Builds the logged copy of a request.
///
/// Credential headers are redacted and oversized bodies are replaced by a
/// truncated string rendering.
#[must_use]
pub fn snapshot_request(
    method: &str,
    headers: &IndexMap<String, String>,
    body: &Value,
    query: &IndexMap<String, String>,
    client_ip: &str,
) -> RequestSnapshot {
    let logged_headers = headers
        .iter()
        .map(|(name, value)| {
            let value = if REDACTED_HEADERS.contains(&name.as_str()) {
                REDACTED.to_owned()
            } else {
                value.clone()
            };
            (name.clone(), value)
        })
        .collect();
    RequestSnapshot {
        method: method.to_owned(),
        headers: logged_headers,
        body: truncate_body(body),
        query: query.clone(),
        client_ip: client_ip.to_owned(),
        user_agent: headers.get("user-agent").cloned(),
    }
}

fn truncate_body(body: &Value) -> Value {
    let rendered = match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if rendered.len() <= MAX_LOGGED_BODY_BYTES {
        return body.clone();
    }
    let mut cut = MAX_LOGGED_BODY_BYTES;
    while !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}{TRUNCATED_MARKER}", &rendered[..cut]))
}

/// Writes one immutable log entry per invocation that reached the sandbox.
#[derive(Clone)]
pub struct ExecutionLogger {
    store: Arc<dyn RouteStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ExecutionLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLogger").finish_non_exhaustive()
    }
}

impl ExecutionLogger {
    #[must_use]
    pub fn new(store: Arc<dyn RouteStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Builds the entry for `report`. Stack traces are always kept here,
    /// whatever the HTTP response shows.
    #[must_use]
    pub fn entry(
        &self,
        route_id: RouteId,
        request: RequestSnapshot,
        report: &ExecutionReport,
    ) -> ExecutionLogEntry {
        let (error_message, error_stack) = match &report.result {
            Ok(_) => (None, None),
            Err(e) => (Some(e.to_string()), e.stack().map(str::to_owned)),
        };
        let outcome = ExecutionOutcome {
            status_code: report.status_code(),
            execution_time_ms: report.execution_time_ms,
            console: report.console.clone(),
            error_message,
            error_stack,
            executed_at: self.clock.now(),
        };
        ExecutionLogEntry::new(route_id, request, outcome)
    }

    /// Persists the entry and bumps the route's counters.
    ///
    /// Never fails: a persistence error is reported to the operator channel
    /// and swallowed.
    pub async fn record(&self, route_id: RouteId, request: RequestSnapshot, report: &ExecutionReport) {
        persist(self.store.as_ref(), self.entry(route_id, request, report)).await;
    }

    /// Runs [`ExecutionLogger::record`] on a background task.
    pub fn spawn(
        &self,
        route_id: RouteId,
        request: RequestSnapshot,
        report: &ExecutionReport,
    ) -> JoinHandle<()> {
        let entry = self.entry(route_id, request, report);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move { persist(store.as_ref(), entry).await })
    }
}

async fn persist(store: &dyn RouteStore, entry: ExecutionLogEntry) {
    if let Err(e) = store.record_execution(&entry).await {
        tracing::error!(
            target: "loom::operator",
            route_id = %entry.route_id,
            execution_id = %entry.id,
            status = entry.status_code,
            error = %e,
            "failed to persist execution log"
        );
    }
}
