//! Shared fixture for gateway integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use loom_core::{
    Clock, HttpMethod, ManualClock, PlanAccessTier, Route, RouteId, RouteSpec, RouteStatus,
    RouteStore,
};
use loom_executor::{DirectoryPackageSource, PackageSource};
use loom_gateway::identity::{JwtSessionResolver, StaticPlanDirectory};
use loom_gateway::{create_router, Engine, EngineParts, LoomConfig, SharedEngine};
use loom_store::MemoryStore;
use serde::Serialize;
use serde_json::Value;
use tower::ServiceExt;

pub const SECRET: &[u8] = b"gateway-test-secret";

pub struct Harness {
    pub app: Router,
    pub engine: SharedEngine,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub packages: tempfile::TempDir,
    _modules: tempfile::TempDir,
}

pub fn harness() -> Harness {
    harness_with(LoomConfig::default())
}

pub fn harness_with(config: LoomConfig) -> Harness {
    harness_with_packages(config, |root| Arc::new(DirectoryPackageSource::new(root)))
}

/// Like [`harness_with`], but packages come from whatever `source` builds
/// over the fixture's package directory.
pub fn harness_with_packages(
    mut config: LoomConfig,
    source: impl FnOnce(&Path) -> Arc<dyn PackageSource>,
) -> Harness {
    let packages = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    let modules = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    std::fs::write(
        packages.path().join("greet.lua"),
        r#"return { hello = function(who) return "hello " .. who end }"#,
    )
    .unwrap_or_else(|e| panic!("write failed: {e}"));
    config.packages.modules_dir = modules.path().to_path_buf();

    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let parts = EngineParts {
        store: Arc::clone(&store) as Arc<dyn RouteStore>,
        clock: Arc::clone(&clock) as Arc<dyn Clock>,
        identities: Arc::new(JwtSessionResolver::new(SECRET, "loom_session")),
        plans: Arc::new(StaticPlanDirectory::new("free").assign("payer", "pro")),
        packages: source(packages.path()),
    };
    let engine = Engine::new(Arc::new(config), parts).shared();
    Harness {
        app: create_router(SharedEngine::clone(&engine)),
        engine,
        store,
        clock,
        packages,
        _modules: modules,
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    exp: i64,
}

/// A session token for `user`, valid for an hour.
pub fn token(user: &str) -> String {
    let claims = Claims { sub: user, exp: Utc::now().timestamp() + 3600 };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET))
        .unwrap_or_else(|e| panic!("encode failed: {e}"))
}

pub fn spec(name: &str, method: HttpMethod, source: &str) -> RouteSpec {
    RouteSpec {
        name: name.to_owned(),
        http_method: method,
        source_code: source.to_owned(),
        status: Some(RouteStatus::Active),
        plan_access_tier: PlanAccessTier::Public,
        ..RouteSpec::default()
    }
}

impl Harness {
    pub async fn register(&self, spec: RouteSpec) -> Route {
        self.engine.registry.register(spec).await.unwrap_or_else(|e| panic!("register failed: {e}"))
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let resp = self
            .app
            .clone()
            .oneshot(request)
            .await
            .unwrap_or_else(|e| panic!("handler error: {e}"));
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap_or_else(|e| panic!("failed to read body: {e}"));
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, headers, body)
    }

    pub async fn call(&self, method: &str, uri: &str) -> (StatusCode, HeaderMap, Value) {
        self.send(empty(method, uri, None)).await
    }

    pub async fn call_as(&self, method: &str, uri: &str, user: &str) -> (StatusCode, HeaderMap, Value) {
        self.send(empty(method, uri, Some(user))).await
    }

    pub async fn route(&self, id: RouteId) -> Route {
        self.store
            .get_route(id)
            .await
            .unwrap_or_else(|e| panic!("get failed: {e}"))
            .unwrap_or_else(|| panic!("route {id} missing"))
    }

    pub async fn log_total(&self, id: RouteId) -> u64 {
        self.store
            .list_logs(id, 200, 0)
            .await
            .unwrap_or_else(|e| panic!("list_logs failed: {e}"))
            .total
    }

    /// Waits for the background logger to have written `n` entries.
    pub async fn wait_for_logs(&self, id: RouteId, n: u64) {
        for _ in 0..200 {
            if self.log_total(id).await >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} log entries for {id}");
    }
}

pub fn empty(method: &str, uri: &str, user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("authorization", format!("Bearer {}", token(user)));
    }
    builder.body(Body::empty()).unwrap_or_else(|e| panic!("failed to build request: {e}"))
}

pub fn json(method: &str, uri: &str, body: &Value, api_key: Option<&str>) -> Request<Body> {
    let mut builder =
        Request::builder().method(method).uri(uri).header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|e| panic!("failed to build request: {e}"))
}
