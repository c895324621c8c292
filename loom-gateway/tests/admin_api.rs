//! Integration tests: the admin API over HTTP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use common::{harness, harness_with, harness_with_packages, json};
use loom_core::{DependencySpec, RouteId, RouteStatus};
use loom_executor::{DirectoryPackageSource, Package, PackageSource, ProvisionError};
use loom_gateway::{LoomConfig, SharedEngine};
use serde_json::{json as j, Value};

const KEY: &str = "admin-key";

fn keyed() -> common::Harness {
    let mut config = LoomConfig::default();
    config.admin.api_key = Some(KEY.to_owned());
    harness_with(config)
}

async fn admin(h: &common::Harness, method: &str, uri: &str, body: &Value) -> (StatusCode, Value) {
    let (status, _, body) = h.send(json(method, uri, body, Some(KEY))).await;
    (status, body)
}

fn id_of(route: &Value) -> String {
    route["id"].as_str().unwrap_or_else(|| panic!("no id in {route}")).to_owned()
}

#[tokio::test]
async fn api_key_is_required_when_configured() {
    let h = keyed();
    let (status, _, body) = h.send(json("GET", "/admin/routes", &Value::Null, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");

    let (status, _, _) = h.send(json("GET", "/admin/routes", &Value::Null, Some("wrong"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = admin(&h, "GET", "/admin/routes", &Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, j!([]));
}

#[tokio::test]
async fn admin_is_open_without_a_key() {
    let h = harness();
    let (status, _, _) = h.send(json("GET", "/admin/routes", &Value::Null, None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn route_lifecycle_over_http() {
    let h = keyed();
    let (status, created) = admin(
        &h,
        "POST",
        "/admin/routes",
        &j!({
            "name": "Hello World",
            "httpMethod": "get",
            "sourceCode": "return function() return 'hi' end",
            "rateLimitPerDay": 5
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["slug"], "hello-world");
    assert_eq!(created["status"], "draft");
    assert_eq!(created["planAccessTier"], "public");
    let id = id_of(&created);

    // Drafts are not dispatchable.
    assert_eq!(h.call("GET", "/api/custom/hello-world").await.0, StatusCode::NOT_FOUND);

    let (status, body) = admin(&h, "POST", "/admin/routes", &j!({"name": "hello world", "httpMethod": "POST"})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "SlugTaken");

    let (status, updated) = admin(
        &h,
        "PATCH",
        &format!("/admin/routes/{id}"),
        &j!({"status": "active", "rateLimitPerDay": null}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"], "active");
    assert_eq!(updated["rateLimitPerDay"], Value::Null);

    let (status, _, body) = h.call("GET", "/api/custom/hello-world").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, j!("hi"));

    let (status, _) = admin(&h, "DELETE", &format!("/admin/routes/{id}"), &Value::Null).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = admin(&h, "GET", &format!("/admin/routes/{id}"), &Value::Null).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "RouteNotFound");
}

#[tokio::test]
async fn activation_requires_compiling_source() {
    let h = keyed();
    let (_, created) = admin(
        &h,
        "POST",
        "/admin/routes",
        &j!({"name": "broken", "httpMethod": "GET", "sourceCode": "return function("}),
    )
    .await;
    let id = id_of(&created);

    let (status, body) =
        admin(&h, "PATCH", &format!("/admin/routes/{id}"), &j!({"status": "active"})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "InvalidSource");

    let (_, route) = admin(&h, "GET", &format!("/admin/routes/{id}"), &Value::Null).await;
    assert_eq!(route["status"], "draft", "a refused activation changes nothing");
}

#[tokio::test]
async fn invalid_input_is_a_client_error() {
    let h = keyed();
    let (status, body) = admin(&h, "POST", "/admin/routes", &j!({"name": "x", "httpMethod": "TRACE"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "InvalidRequest");

    let (status, body) = admin(&h, "POST", "/admin/routes", &j!({"name": "!!!", "httpMethod": "GET"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");

    let (status, body) = admin(&h, "GET", "/admin/routes/not-a-uuid", &Value::Null).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "InvalidRequest");
}

#[tokio::test]
async fn deploy_creates_then_overwrites_in_place() {
    let h = keyed();
    let (status, first) = admin(
        &h,
        "POST",
        "/admin/deploy",
        &j!({
            "name": "Report",
            "path": "/api/logic/report",
            "source": "return function() return { v = 1 } end",
            "methods": ["GET", "POST"]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["kind"], "logic");
    assert_eq!(first["status"], "active");
    assert_eq!(first["httpMethod"], "GET");

    let (status, _, body) = h.call("GET", "/api/logic/report").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, j!({"v": 1}));
    h.wait_for_logs(id_of(&first).parse().unwrap_or_else(|e| panic!("{e}")), 1).await;

    let (status, second) = admin(
        &h,
        "POST",
        "/admin/deploy",
        &j!({
            "name": "Report v2",
            "path": "/api/logic/report",
            "source": "return function() return { v = 2 } end",
            "methods": ["GET"]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["id"], first["id"]);
    assert_eq!(second["name"], "Report v2");
    assert_eq!(second["executionCount"], 1, "redeploy keeps counters");

    let (_, _, body) = h.call("GET", "/api/logic/report").await;
    assert_eq!(body, j!({"v": 2}));
}

#[tokio::test]
async fn deploy_rejects_empty_methods_and_broken_source() {
    let h = keyed();
    let (status, _) = admin(
        &h,
        "POST",
        "/admin/deploy",
        &j!({"name": "n", "path": "n", "source": "return function() end", "methods": []}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = admin(
        &h,
        "POST",
        "/admin/deploy",
        &j!({"name": "n", "path": "n", "source": "return function(", "methods": ["GET"]}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn dependency_install_reports_partial_success() {
    let h = keyed();
    let (_, created) = admin(
        &h,
        "POST",
        "/admin/routes",
        &j!({
            "name": "deps",
            "httpMethod": "GET",
            "dependencies": ["greet", "missing-pkg"],
            "sourceCode": "return function() return require('greet').hello('x') end",
            "status": "active"
        }),
    )
    .await;
    let id = id_of(&created);

    let (status, body) =
        admin(&h, "POST", &format!("/admin/routes/{id}/dependencies"), &Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report"]["installed"], j!(["greet"]));
    assert_eq!(body["report"]["failed"][0]["name"], "missing-pkg");
    assert_eq!(body["route"]["installedDependencies"], j!(["greet"]));

    let (status, _, body) = h.call("GET", "/api/custom/deps").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, j!("hello x"));
}

#[tokio::test]
async fn logs_are_paged_newest_first_with_clamped_limit() {
    let h = keyed();
    let (_, created) = admin(
        &h,
        "POST",
        "/admin/routes",
        &j!({
            "name": "counter",
            "httpMethod": "GET",
            "sourceCode": "return function(req) return { n = tonumber(req.query.n) } end",
            "status": "active"
        }),
    )
    .await;
    let id = id_of(&created);
    let route_id = id.parse().unwrap_or_else(|e| panic!("{e}"));

    for n in 1..=3 {
        assert_eq!(h.call("GET", &format!("/api/custom/counter?n={n}")).await.0, StatusCode::OK);
        h.wait_for_logs(route_id, n).await;
    }

    let (status, page) =
        admin(&h, "GET", &format!("/admin/routes/{id}/logs?limit=0"), &Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 3);
    let logs = page["logs"].as_array().unwrap_or_else(|| panic!("logs not an array"));
    assert_eq!(logs.len(), 1, "limit 0 is clamped to 1");
    assert_eq!(logs[0]["requestQuery"]["n"], "3");

    let (_, page) =
        admin(&h, "GET", &format!("/admin/routes/{id}/logs?offset=1"), &Value::Null).await;
    let queries: Vec<&Value> =
        page["logs"].as_array().map(|l| l.iter().map(|e| &e["requestQuery"]["n"]).collect()).unwrap_or_default();
    assert_eq!(queries, vec![&j!("2"), &j!("1")]);
}

/// Serves the fixture packages after a fixed delay per fetch.
struct SlowPackages {
    inner: DirectoryPackageSource,
    delay: Duration,
}

#[async_trait]
impl PackageSource for SlowPackages {
    async fn fetch(&self, spec: &DependencySpec) -> Result<Package, ProvisionError> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch(spec).await
    }
}

#[tokio::test]
async fn deploy_during_dependency_install_is_kept() {
    let mut config = LoomConfig::default();
    config.admin.api_key = Some(KEY.to_owned());
    let h = harness_with_packages(config, |root| {
        Arc::new(SlowPackages {
            inner: DirectoryPackageSource::new(root),
            delay: Duration::from_millis(300),
        })
    });
    let (_, created) = admin(
        &h,
        "POST",
        "/admin/routes",
        &j!({
            "name": "racy",
            "httpMethod": "GET",
            "dependencies": ["greet"],
            "sourceCode": "return function() return 'v1' end",
            "status": "active"
        }),
    )
    .await;
    let id: RouteId = id_of(&created).parse().unwrap_or_else(|e| panic!("{e}"));

    let engine = SharedEngine::clone(&h.engine);
    let install = tokio::spawn(async move { engine.registry.install_dependencies(id).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, _) = admin(
        &h,
        "POST",
        "/admin/deploy",
        &j!({
            "name": "racy",
            "path": "racy",
            "source": "return function() return require('greet').hello('v2') end",
            "methods": ["GET"]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (route, report) = match install.await {
        Ok(Ok(done)) => done,
        other => panic!("install failed: {other:?}"),
    };
    assert_eq!(report.installed, vec!["greet".to_owned()]);
    assert!(route.source_code.contains("v2"), "install returned {}", route.source_code);

    let stored = h.route(id).await;
    assert_eq!(stored.status, RouteStatus::Active);
    assert!(stored.source_code.contains("v2"), "deploy was overwritten: {}", stored.source_code);
    assert_eq!(stored.installed_dependencies, vec!["greet".to_owned()]);

    let (status, _, body) = h.call("GET", "/api/custom/racy").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, j!("hello v2"));
}
