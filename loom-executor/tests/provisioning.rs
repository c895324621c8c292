//! Integration tests: per-route dependency provisioning round trips.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use loom_core::{DependencySpec, HttpMethod, Route, RouteSpec};
use loom_executor::{
    compile, DependencyProvisioner, DirectoryPackageSource, ExecutionError, InvocationContext,
    ModuleResolver, ModuleSet, Package, PackageSource, ProvisionError, ResponseBody, Sandbox,
    SandboxLimits,
};
use serde_json::json;

fn write(dir: &Path, file: &str, source: &str) {
    std::fs::write(dir.join(file), source).unwrap_or_else(|e| panic!("write {file} failed: {e}"));
}

fn route_with_deps(deps: &[&str]) -> Route {
    let spec = RouteSpec {
        name: "deps".to_owned(),
        http_method: HttpMethod::Get,
        dependencies: deps.iter().map(|d| (*d).to_owned()).collect(),
        ..RouteSpec::default()
    };
    Route::from_spec(spec, Utc::now()).unwrap_or_else(|e| panic!("from_spec failed: {e}"))
}

struct Fixture {
    registry: tempfile::TempDir,
    modules: tempfile::TempDir,
    provisioner: DependencyProvisioner,
}

fn fixture() -> Fixture {
    let registry = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    let modules = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    write(registry.path(), "shout.lua", r#"return { up = function(s) return string.upper(s) end }"#);
    write(registry.path(), "shout@2.0.lua", r#"return { up = function(s) return string.upper(s) .. "!" end }"#);
    write(registry.path(), "broken.lua", "return {");
    let source = Arc::new(DirectoryPackageSource::new(registry.path()));
    let provisioner = DependencyProvisioner::new(source, modules.path());
    Fixture { registry, modules, provisioner }
}

async fn execute(provisioner: &DependencyProvisioner, route: &Route, source: &str) -> Result<ResponseBody, ExecutionError> {
    let modules = provisioner
        .modules_for(route)
        .await
        .unwrap_or_else(|e| panic!("modules_for failed: {e}"));
    let exe = compile(source, "deps").unwrap_or_else(|e| panic!("compile failed: {e}"));
    let report = Sandbox::default()
        .run(&exe, InvocationContext::default(), &ModuleResolver::new(modules), SandboxLimits::default())
        .await;
    report.result.map(|r| r.body)
}

#[tokio::test]
async fn install_then_require_returns_package_data() {
    let fx = fixture();
    let mut route = route_with_deps(&["shout"]);
    let report = fx
        .provisioner
        .install(route.id, &route.declared_dependencies)
        .await
        .unwrap_or_else(|e| panic!("install failed: {e}"));
    assert_eq!(report.installed, vec!["shout".to_owned()]);
    assert!(report.failed.is_empty());
    route.installed_dependencies = report.installed;

    let body = execute(&fx.provisioner, &route, r#"return function() return require("shout").up("hi") end"#).await;
    assert_eq!(body, Ok(ResponseBody::Text("HI".to_owned())));
}

#[tokio::test]
async fn routes_get_isolated_versions() {
    let fx = fixture();
    let mut v1 = route_with_deps(&["shout"]);
    let mut v2 = route_with_deps(&["shout@2.0"]);
    for route in [&mut v1, &mut v2] {
        let report = fx
            .provisioner
            .install(route.id, &route.declared_dependencies)
            .await
            .unwrap_or_else(|e| panic!("install failed: {e}"));
        route.installed_dependencies = report.installed;
    }

    let source = r#"return function() return require("shout").up("hi") end"#;
    assert_eq!(execute(&fx.provisioner, &v1, source).await, Ok(ResponseBody::Text("HI".to_owned())));
    assert_eq!(execute(&fx.provisioner, &v2, source).await, Ok(ResponseBody::Text("HI!".to_owned())));
}

#[tokio::test]
async fn failed_packages_are_reported_and_stay_missing() {
    let fx = fixture();
    let mut route = route_with_deps(&["shout", "broken", "absent"]);
    let report = fx
        .provisioner
        .install(route.id, &route.declared_dependencies)
        .await
        .unwrap_or_else(|e| panic!("install failed: {e}"));
    assert_eq!(report.installed, vec!["shout".to_owned()]);
    let failed: Vec<&str> = report.failed.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(failed, vec!["broken", "absent"]);
    route.installed_dependencies = report.installed;

    let result = execute(&fx.provisioner, &route, r#"return function() return require("absent") end"#).await;
    assert!(matches!(result, Err(ExecutionError::DependencyMissing { ref name, .. }) if name == "absent"));
}

#[tokio::test]
async fn declared_but_not_installed_is_missing() {
    let fx = fixture();
    let route = route_with_deps(&["shout"]);
    let report = fx
        .provisioner
        .install(route.id, &route.declared_dependencies)
        .await
        .unwrap_or_else(|e| panic!("install failed: {e}"));
    assert_eq!(report.installed.len(), 1);

    // The route record was never updated, so nothing is installed from its point of view.
    let result = execute(&fx.provisioner, &route, r#"return function() return require("shout") end"#).await;
    assert!(matches!(result, Err(ExecutionError::DependencyMissing { .. })));
}

#[tokio::test]
async fn shrinking_installed_list_invalidates_cache() {
    let fx = fixture();
    let mut route = route_with_deps(&["shout"]);
    let report = fx
        .provisioner
        .install(route.id, &route.declared_dependencies)
        .await
        .unwrap_or_else(|e| panic!("install failed: {e}"));
    route.installed_dependencies = report.installed;
    let source = r#"return function() return require("shout").up("a") end"#;
    assert!(execute(&fx.provisioner, &route, source).await.is_ok());

    route.installed_dependencies.clear();
    assert!(matches!(
        execute(&fx.provisioner, &route, source).await,
        Err(ExecutionError::DependencyMissing { .. })
    ));
}

/// Serves packages from a directory after a fixed delay per fetch.
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

async fn install_while_reading(
    provisioner: &DependencyProvisioner,
    route: &Route,
) -> Arc<ModuleSet> {
    let (report, during) = tokio::join!(
        provisioner.install(route.id, &route.declared_dependencies),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            provisioner.modules_for(route).await
        },
    );
    let report = report.unwrap_or_else(|e| panic!("install failed: {e}"));
    assert_eq!(report.installed, route.installed_dependencies);
    during.unwrap_or_else(|e| panic!("modules_for failed: {e}"))
}

#[tokio::test]
async fn reads_during_install_do_not_pin_a_stale_set() {
    let fx = fixture();
    let source = Arc::new(SlowPackages {
        inner: DirectoryPackageSource::new(fx.registry.path()),
        delay: Duration::from_millis(200),
    });
    let provisioner = DependencyProvisioner::new(source, fx.modules.path());
    let mut route = route_with_deps(&["shout"]);
    route.installed_dependencies = vec!["shout".to_owned()];
    let handler = r#"return function() return require("shout").up("hi") end"#;

    let during = install_while_reading(&provisioner, &route).await;
    assert!(during.is_empty(), "nothing is on disk before the first install lands");
    let after = provisioner.modules_for(&route).await.unwrap_or_else(|e| panic!("modules_for failed: {e}"));
    assert_eq!(after.len(), 1);
    assert_eq!(execute(&provisioner, &route, handler).await, Ok(ResponseBody::Text("HI".to_owned())));

    let during = install_while_reading(&provisioner, &route).await;
    assert_eq!(during.len(), 1, "the previous install stays readable until the swap");
    let after = provisioner.modules_for(&route).await.unwrap_or_else(|e| panic!("modules_for failed: {e}"));
    assert_eq!(after.len(), 1);
    assert_eq!(execute(&provisioner, &route, handler).await, Ok(ResponseBody::Text("HI".to_owned())));

    let leftovers: Vec<_> = std::fs::read_dir(fx.modules.path())
        .unwrap_or_else(|e| panic!("read_dir failed: {e}"))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert!(leftovers.is_empty(), "scratch directories left behind: {leftovers:?}");
}

#[tokio::test]
async fn remove_deletes_route_directory() {
    let fx = fixture();
    let route = route_with_deps(&["shout"]);
    fx.provisioner
        .install(route.id, &route.declared_dependencies)
        .await
        .unwrap_or_else(|e| panic!("install failed: {e}"));
    let dir = fx.modules.path().join(route.id.to_string());
    assert!(dir.join("shout.lua").exists());

    fx.provisioner.remove(route.id).await.unwrap_or_else(|e| panic!("remove failed: {e}"));
    assert!(!dir.exists());
    fx.provisioner.remove(route.id).await.unwrap_or_else(|e| panic!("second remove failed: {e}"));
}

#[tokio::test]
async fn json_body_round_trip_via_package() {
    let fx = fixture();
    let mut route = route_with_deps(&["shout@2.0"]);
    let report = fx
        .provisioner
        .install(route.id, &route.declared_dependencies)
        .await
        .unwrap_or_else(|e| panic!("install failed: {e}"));
    route.installed_dependencies = report.installed;
    let body = execute(
        &fx.provisioner,
        &route,
        r#"return function() return { status = 200, body = { v = require("shout").up("x") } } end"#,
    )
    .await;
    assert_eq!(body, Ok(ResponseBody::Json(json!({"v": "X!"}))));
}
