//! Per-route dependency provisioning.
//!
//! Each route owns `<modules_dir>/<route_id>/`, holding one `<name>.lua`
//! file per installed package. Two routes can therefore depend on
//! different versions of the same package.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use loom_core::{DependencySpec, Route, RouteId};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::executable::compile;
use crate::resolver::ModuleSet;

/// Lua source for one package version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub version: Option<String>,
    pub source: String,
}

/// Where package sources come from.
///
/// # Cancel Safety
/// Implementations must be cancel safe; a dropped fetch has no side effects.
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// Fetches the package described by `spec`.
    ///
    /// # Errors
    /// Returns [`ProvisionError::PackageNotFound`] if the source has no such
    /// package, or [`ProvisionError::Fetch`] if it could not be reached.
    async fn fetch(&self, spec: &DependencySpec) -> Result<Package, ProvisionError>;
}

/// Reads packages from a local directory: `<root>/<name>@<version>.lua`
/// when a version is requested and present, else `<root>/<name>.lua`.
#[derive(Debug, Clone)]
pub struct DirectoryPackageSource {
    root: PathBuf,
}

impl DirectoryPackageSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn candidates(&self, spec: &DependencySpec) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(2);
        if let Some(version) = &spec.version {
            paths.push(self.root.join(format!("{}@{version}.lua", spec.name)));
        }
        paths.push(self.root.join(format!("{}.lua", spec.name)));
        paths
    }
}

#[async_trait]
impl PackageSource for DirectoryPackageSource {
    async fn fetch(&self, spec: &DependencySpec) -> Result<Package, ProvisionError> {
        for path in self.candidates(spec) {
            match tokio::fs::read_to_string(&path).await {
                Ok(source) => {
                    return Ok(Package {
                        name: spec.name.clone(),
                        version: spec.version.clone(),
                        source,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(ProvisionError::Io { path, source }),
            }
        }
        Err(ProvisionError::PackageNotFound { name: spec.to_string() })
    }
}

/// Fetches packages over HTTP: `GET {base}/{name}/{version|latest}.lua`.
#[derive(Debug, Clone)]
pub struct HttpPackageSource {
    base: url::Url,
    client: reqwest::Client,
}

impl HttpPackageSource {
    /// Request timeout for a single package download.
    pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a source rooted at `base`.
    ///
    /// # Errors
    /// Returns [`ProvisionError::InvalidRegistryUrl`] if `base` is not an
    /// absolute http(s) URL.
    pub fn new(base: &str) -> Result<Self, ProvisionError> {
        let invalid = |reason: String| ProvisionError::InvalidRegistryUrl {
            url: base.to_owned(),
            reason,
        };
        let mut url = url::Url::parse(base).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https".to_owned()));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(Self::FETCH_TIMEOUT)
            .build()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self { base: url, client })
    }

    fn package_url(&self, spec: &DependencySpec) -> Result<url::Url, ProvisionError> {
        let version = spec.version.as_deref().unwrap_or("latest");
        self.base.join(&format!("{}/{version}.lua", spec.name)).map_err(|e| {
            ProvisionError::Fetch { name: spec.to_string(), reason: e.to_string() }
        })
    }
}

#[async_trait]
impl PackageSource for HttpPackageSource {
    async fn fetch(&self, spec: &DependencySpec) -> Result<Package, ProvisionError> {
        let url = self.package_url(spec)?;
        let fetch_err = |reason: String| ProvisionError::Fetch { name: spec.to_string(), reason };
        let response =
            self.client.get(url.clone()).send().await.map_err(|e| fetch_err(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProvisionError::PackageNotFound { name: spec.to_string() });
        }
        if !response.status().is_success() {
            return Err(fetch_err(format!("{url} answered {}", response.status())));
        }
        let source = response.text().await.map_err(|e| fetch_err(e.to_string()))?;
        Ok(Package { name: spec.name.clone(), version: spec.version.clone(), source })
    }
}

/// A dependency that could not be installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDependency {
    pub name: String,
    pub reason: String,
}

/// Outcome of provisioning a route's declared dependencies.
///
/// `installed` holds the declared strings (including any `@version`) that
/// became available, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub failed: Vec<FailedDependency>,
}

#[derive(Debug)]
struct CachedModules {
    generation: u64,
    installed: Vec<String>,
    modules: Arc<ModuleSet>,
}

/// Installs packages into per-route directories and loads them back as
/// [`ModuleSet`]s for the sandbox.
///
/// An install is staged in a scratch directory and swapped in whole, so a
/// concurrent load sees either the previous set or the new one. Every swap
/// bumps the route's generation; cached sets from an older generation are
/// never served.
pub struct DependencyProvisioner {
    source: Arc<dyn PackageSource>,
    modules_dir: PathBuf,
    cache: DashMap<RouteId, CachedModules>,
    generations: DashMap<RouteId, u64>,
}

impl std::fmt::Debug for DependencyProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyProvisioner")
            .field("modules_dir", &self.modules_dir)
            .field("cached_routes", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl DependencyProvisioner {
    #[must_use]
    pub fn new(source: Arc<dyn PackageSource>, modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            modules_dir: modules_dir.into(),
            cache: DashMap::new(),
            generations: DashMap::new(),
        }
    }

    fn route_dir(&self, route_id: RouteId) -> PathBuf {
        self.modules_dir.join(route_id.to_string())
    }

    fn scratch_dir(&self, prefix: &str, route_id: RouteId) -> PathBuf {
        self.modules_dir.join(format!(".{prefix}-{route_id}-{}", Uuid::new_v4()))
    }

    fn generation(&self, route_id: RouteId) -> u64 {
        self.generations.get(&route_id).map_or(0, |g| *g)
    }

    fn invalidate(&self, route_id: RouteId) {
        *self.generations.entry(route_id).or_insert(0) += 1;
        self.cache.remove(&route_id);
    }

    /// Replaces the route's installed set with `declared`.
    ///
    /// Each entry is fetched, syntax-checked, and written to a staging
    /// directory that replaces the route's directory once every entry has
    /// been tried. Entries that fail are reported in
    /// [`InstallReport::failed`]; they never fall back to anything else.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Io`] only if the staging directory cannot
    /// be created or swapped in. The previous set stays in place.
    pub async fn install(
        &self,
        route_id: RouteId,
        declared: &[String],
    ) -> Result<InstallReport, ProvisionError> {
        let staging = self.scratch_dir("staging", route_id);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|source| ProvisionError::Io { path: staging.clone(), source })?;

        let mut report = InstallReport::default();
        for raw in declared {
            match self.install_one(&staging, raw).await {
                Ok(()) => report.installed.push(raw.clone()),
                Err(e) => {
                    tracing::warn!(%route_id, dependency = %raw, error = %e, "dependency install failed");
                    report.failed.push(FailedDependency { name: raw.clone(), reason: e.to_string() });
                }
            }
        }

        if let Err(e) = self.swap_in(route_id, &staging).await {
            if let Err(cleanup) = remove_dir_if_present(&staging).await {
                tracing::warn!(%route_id, error = %cleanup, "failed to remove staging directory");
            }
            return Err(e);
        }
        self.invalidate(route_id);
        tracing::info!(
            %route_id,
            installed = report.installed.len(),
            failed = report.failed.len(),
            "dependencies provisioned"
        );
        Ok(report)
    }

    async fn swap_in(&self, route_id: RouteId, staging: &Path) -> Result<(), ProvisionError> {
        let dir = self.route_dir(route_id);
        let retired = self.scratch_dir("retired", route_id);
        match tokio::fs::rename(&dir, &retired).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ProvisionError::Io { path: dir, source }),
        }
        if let Err(source) = tokio::fs::rename(staging, &dir).await {
            if let Err(e) = tokio::fs::rename(&retired, &dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(%route_id, error = %e, "failed to restore previous module directory");
                }
            }
            return Err(ProvisionError::Io { path: dir, source });
        }
        if let Err(e) = remove_dir_if_present(&retired).await {
            tracing::warn!(%route_id, error = %e, "failed to remove retired module directory");
        }
        Ok(())
    }

    async fn install_one(&self, dir: &Path, raw: &str) -> Result<(), ProvisionError> {
        let spec = DependencySpec::parse(raw)?;
        let package = self.source.fetch(&spec).await?;
        compile(&package.source, &format!("module:{}", spec.name)).map_err(|e| {
            ProvisionError::InvalidPackage { name: spec.to_string(), reason: e.to_string() }
        })?;
        let path = dir.join(format!("{}.lua", spec.name));
        tokio::fs::write(&path, package.source.as_bytes())
            .await
            .map_err(|source| ProvisionError::Io { path, source })
    }

    /// Loads the modules listed in `route.installed_dependencies`.
    ///
    /// Only installed names are loaded: a declared-but-not-installed name is
    /// absent from the set and fails at `require` time. A complete set is
    /// cached per route until the installed list changes or the route is
    /// re-provisioned; a set with missing files is returned but not cached.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Io`] if an installed module file exists but
    /// cannot be read.
    pub async fn modules_for(&self, route: &Route) -> Result<Arc<ModuleSet>, ProvisionError> {
        let generation = self.generation(route.id);
        if let Some(cached) = self.cache.get(&route.id) {
            if cached.generation == generation && cached.installed == route.installed_dependencies {
                return Ok(Arc::clone(&cached.modules));
            }
        }

        let dir = self.route_dir(route.id);
        let mut set = ModuleSet::new(route.id);
        let mut complete = true;
        for raw in &route.installed_dependencies {
            let Ok(spec) = DependencySpec::parse(raw) else {
                continue;
            };
            let path = dir.join(format!("{}.lua", spec.name));
            match tokio::fs::read_to_string(&path).await {
                Ok(source) => set.insert(spec.name, source),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(route_id = %route.id, dependency = %raw, "installed module file is missing");
                    complete = false;
                }
                Err(source) => return Err(ProvisionError::Io { path, source }),
            }
        }

        let modules = Arc::new(set);
        if complete && self.generation(route.id) == generation {
            self.cache.insert(
                route.id,
                CachedModules {
                    generation,
                    installed: route.installed_dependencies.clone(),
                    modules: Arc::clone(&modules),
                },
            );
        }
        Ok(modules)
    }

    /// Deletes the route's module directory and cached set.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Io`] if the directory exists but cannot be
    /// removed.
    pub async fn remove(&self, route_id: RouteId) -> Result<(), ProvisionError> {
        self.invalidate(route_id);
        remove_dir_if_present(&self.route_dir(route_id)).await
    }
}

async fn remove_dir_if_present(dir: &Path) -> Result<(), ProvisionError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ProvisionError::Io { path: dir.to_path_buf(), source }),
    }
}
