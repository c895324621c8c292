//! Values crossing the sandbox boundary.

use indexmap::IndexMap;
use loom_core::ConsoleEntry;

use crate::error::ExecutionError;

/// The authenticated caller as seen by handler code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationUser {
    pub id: String,
    pub plan: String,
}

/// Request data exposed to the handler as its `request` argument.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationContext {
    pub method: String,
    pub path: String,
    pub slug: String,
    /// Header names must already be lower-cased.
    pub headers: IndexMap<String, String>,
    pub query: IndexMap<String, String>,
    /// Decoded JSON when the body parsed as JSON, a string otherwise,
    /// `Null` when empty.
    pub body: serde_json::Value,
    pub client_ip: String,
    pub user: Option<InvocationUser>,
}

/// Body produced by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Text(String),
    Json(serde_json::Value),
}

/// A successful handler result, ready to be written to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: IndexMap<String, String>,
    pub body: ResponseBody,
}

impl HandlerResponse {
    /// A 200 response with a JSON body.
    #[must_use]
    pub fn json(body: serde_json::Value) -> Self {
        Self { status: 200, headers: IndexMap::new(), body: ResponseBody::Json(body) }
    }
}

/// Everything one sandbox run produced, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub result: Result<HandlerResponse, ExecutionError>,
    pub console: Vec<ConsoleEntry>,
    pub execution_time_ms: u64,
}

impl ExecutionReport {
    /// Status code recorded for this run: the handler's on success, 500 on
    /// any execution error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match &self.result {
            Ok(response) => response.status,
            Err(_) => 500,
        }
    }
}
