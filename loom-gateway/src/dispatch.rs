//! The request pipeline for registered routes.
//!
//! `lookup -> access gate -> rate limiter -> modules -> sandbox -> logger`.
//! Lookup, gate, and limiter failures short-circuit with no log entry;
//! everything that reaches the sandbox is logged, success or not.

use std::fmt::Display;
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use indexmap::IndexMap;
use loom_core::{CallerKey, Route, RouteKind};
use loom_executor::{
    compile, ExecutionError, ExecutionReport, HandlerResponse, InvocationContext, InvocationUser,
    ModuleResolver, ResponseBody,
};
use serde_json::Value;

use crate::access::Admission;
use crate::engine::{Engine, SharedEngine};
use crate::error::DispatchError;
use crate::logger::snapshot_request;
use crate::ratelimit::RateDecision;

/// Largest request body a handler will be given.
pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// `ANY /api/custom/{slug}`
///
/// # Errors
/// Returns a [`DispatchError`] envelope for rejections and handler failures.
pub async fn dispatch_custom(
    State(engine): State<SharedEngine>,
    Path(slug): Path<String>,
    request: Request,
) -> Result<Response, DispatchError> {
    dispatch(&engine, RouteKind::Custom, &slug, request).await
}

/// `ANY /api/logic/{slug}`
///
/// # Errors
/// Returns a [`DispatchError`] envelope for rejections and handler failures.
pub async fn dispatch_logic(
    State(engine): State<SharedEngine>,
    Path(slug): Path<String>,
    request: Request,
) -> Result<Response, DispatchError> {
    dispatch(&engine, RouteKind::Logic, &slug, request).await
}

/// Runs one request through the full pipeline.
///
/// # Errors
/// See [`DispatchError`]. Execution failures are returned only after they
/// have been handed to the execution logger.
pub async fn dispatch(
    engine: &Engine,
    kind: RouteKind,
    slug: &str,
    request: Request,
) -> Result<Response, DispatchError> {
    let (parts, body) = request.into_parts();

    let route = engine
        .registry
        .lookup(kind, slug)
        .await
        .map_err(persistence_failure)?
        .ok_or_else(|| DispatchError::RouteNotFound { kind, slug: slug.to_owned() })?;

    let admission = engine.gate.admit(&route, &parts.method, &parts.headers).await.inspect_err(
        |e| tracing::debug!(route_id = %route.id, slug = %route.slug, kind = e.kind(), "request rejected"),
    )?;

    let body = axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|_| DispatchError::BodyTooLarge { limit: MAX_REQUEST_BODY_BYTES })?;

    let client_ip = client_ip(&parts, engine.config.server.trust_forwarded_for);
    let caller = match &admission.identity {
        Some(identity) => CallerKey::User(identity.user_id.clone()),
        None => CallerKey::Address(client_ip.clone()),
    };
    match engine.limiter.check_and_record(&route, &caller).await.map_err(persistence_failure)? {
        RateDecision::Allowed => {}
        RateDecision::Exceeded { limit, used, retry_after_secs } => {
            return Err(DispatchError::RateLimitExceeded { limit, used, retry_after_secs });
        }
    }

    let headers = header_map(&parts.headers);
    let query = Query::<IndexMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(q)| q)
        .unwrap_or_default();
    let body = decode_body(&body);
    let snapshot = snapshot_request(parts.method.as_str(), &headers, &body, &query, &client_ip);

    let ctx = InvocationContext {
        method: parts.method.as_str().to_owned(),
        path: parts.uri.path().to_owned(),
        slug: route.slug.to_string(),
        headers,
        query,
        body,
        client_ip,
        user: invocation_user(admission),
    };
    let report = execute(engine, &route, ctx).await;
    engine.logger.spawn(route.id, snapshot, &report);

    tracing::info!(
        route_id = %route.id,
        slug = %route.slug,
        status = report.status_code(),
        elapsed_ms = report.execution_time_ms,
        "route executed"
    );

    match report.result {
        Ok(response) => Ok(into_http(response)),
        Err(error) => Err(DispatchError::Execution {
            error,
            expose_stack: engine.config.sandbox.expose_stack_traces,
        }),
    }
}

async fn execute(engine: &Engine, route: &Route, ctx: InvocationContext) -> ExecutionReport {
    let modules = match engine.provisioner.modules_for(route).await {
        Ok(modules) => modules,
        Err(e) => {
            tracing::error!(target: "loom::operator", route_id = %route.id, error = %e, "failed to load installed modules");
            return failed_before_run(ExecutionError::Internal(e.to_string()));
        }
    };
    let executable = match compile(&route.source_code, route.slug.as_str()) {
        Ok(executable) => executable,
        Err(e) => return failed_before_run(e),
    };
    let limits = engine.config.sandbox.limits_for(route.kind);
    engine.sandbox.run(&executable, ctx, &ModuleResolver::new(modules), limits).await
}

fn failed_before_run(error: ExecutionError) -> ExecutionReport {
    ExecutionReport { result: Err(error), console: Vec::new(), execution_time_ms: 0 }
}

fn persistence_failure(e: impl Display) -> DispatchError {
    tracing::error!(target: "loom::operator", error = %e, "dispatch hit a persistence failure");
    DispatchError::Persistence(e.to_string())
}

fn invocation_user(admission: Admission) -> Option<InvocationUser> {
    let identity = admission.identity?;
    Some(InvocationUser {
        id: identity.user_id.to_string(),
        plan: admission.tier.map(|t| t.plan().to_owned()).unwrap_or_default(),
    })
}

/// First `X-Forwarded-For` hop when trusted, else the TCP peer, else
/// `unknown`.
fn client_ip(parts: &Parts, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(addr) = forwarded {
            return addr.to_owned();
        }
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_owned(), |ConnectInfo(addr)| addr.ip().to_string())
}

/// Lower-cased names; repeated headers are joined with `, `.
fn header_map(headers: &HeaderMap) -> IndexMap<String, String> {
    let mut out: IndexMap<String, String> = IndexMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        out.entry(name.as_str().to_owned())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    out
}

fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

const FRAMING_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

fn into_http(response: HandlerResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let (content_type, body) = match response.body {
        ResponseBody::Empty => (None, Body::empty()),
        ResponseBody::Text(text) => (Some("text/plain; charset=utf-8"), Body::from(text)),
        ResponseBody::Json(value) => (Some("application/json"), Body::from(value.to_string())),
    };

    let mut out = (status, body).into_response();
    for (name, value) in &response.headers {
        if FRAMING_HEADERS.contains(&name.as_str()) {
            continue;
        }
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                out.headers_mut().append(name, value);
            }
            _ => tracing::warn!(header = %name, "dropping invalid response header set by handler"),
        }
    }
    if let Some(content_type) = content_type {
        out.headers_mut()
            .entry(header::CONTENT_TYPE)
            .or_insert(HeaderValue::from_static(content_type));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;
    use serde_json::json;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        match builder.body(()) {
            Ok(req) => req.into_parts().0,
            Err(e) => panic!("failed to build request: {e}"),
        }
    }

    #[test]
    fn forwarded_for_is_used_only_when_trusted() {
        let mut p = parts(HttpRequest::builder().header("x-forwarded-for", "203.0.113.9, 10.0.0.1"));
        assert_eq!(client_ip(&p, true), "203.0.113.9");
        assert_eq!(client_ip(&p, false), "unknown");

        p.extensions.insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 5], 4000))));
        assert_eq!(client_ip(&p, false), "192.0.2.5");
    }

    #[test]
    fn repeated_headers_are_joined() {
        let p = parts(HttpRequest::builder().header("X-Tag", "a").header("x-tag", "b"));
        let map = header_map(&p.headers);
        assert_eq!(map.get("x-tag").map(String::as_str), Some("a, b"));
    }

    #[test]
    fn bodies_decode_as_json_text_or_null() {
        assert_eq!(decode_body(b""), Value::Null);
        assert_eq!(decode_body(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(decode_body(b"plain words"), json!("plain words"));
    }

    #[test]
    fn handler_response_keeps_its_content_type() {
        let mut response = HandlerResponse::json(json!({"ok": true}));
        response.status = 201;
        response.headers.insert("content-type".to_owned(), "application/vnd.loom+json".to_owned());
        response.headers.insert("content-length".to_owned(), "999".to_owned());
        let http = into_http(response);
        assert_eq!(http.status(), StatusCode::CREATED);
        assert_eq!(
            http.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/vnd.loom+json")
        );
        assert_ne!(
            http.headers().get(header::CONTENT_LENGTH).and_then(|v| v.to_str().ok()),
            Some("999")
        );
    }
}
