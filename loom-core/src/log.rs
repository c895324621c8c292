use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::id::{ExecutionId, RouteId};

/// Severity of a captured console call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

/// One console-style call made by handler code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    #[serde(rename = "type")]
    pub level: ConsoleLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ConsoleEntry {
    #[must_use]
    pub fn new(level: ConsoleLevel, message: String) -> Self {
        Self { level, message, timestamp: Utc::now() }
    }
}

/// The request half of an execution log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub method: String,
    pub headers: IndexMap<String, String>,
    pub body: serde_json::Value,
    pub query: IndexMap<String, String>,
    pub client_ip: String,
    pub user_agent: Option<String>,
}

/// Immutable record of one invocation that reached the executor.
///
/// Entries are written once by the execution logger and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub id: ExecutionId,
    pub route_id: RouteId,
    pub method: String,
    pub request_headers: IndexMap<String, String>,
    pub request_body: serde_json::Value,
    pub request_query: IndexMap<String, String>,
    pub status_code: u16,
    pub execution_time_ms: u64,
    pub console_capture: Vec<ConsoleEntry>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionLogEntry {
    /// Builds an entry from a request snapshot and the executor's outcome.
    #[must_use]
    pub fn new(route_id: RouteId, request: RequestSnapshot, outcome: ExecutionOutcome) -> Self {
        Self {
            id: ExecutionId::new(),
            route_id,
            method: request.method,
            request_headers: request.headers,
            request_body: request.body,
            request_query: request.query,
            status_code: outcome.status_code,
            execution_time_ms: outcome.execution_time_ms,
            console_capture: outcome.console,
            error_message: outcome.error_message,
            error_stack: outcome.error_stack,
            client_ip: request.client_ip,
            user_agent: request.user_agent,
            executed_at: outcome.executed_at,
        }
    }
}

/// The response half of an execution log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status_code: u16,
    pub execution_time_ms: u64,
    pub console: Vec<ConsoleEntry>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// A page of execution log entries, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPage {
    pub logs: Vec<ExecutionLogEntry>,
    pub total: u64,
}
