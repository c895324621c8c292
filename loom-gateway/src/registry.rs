//! The route registry: the only writer of route records.
//!
//! Admin endpoints and the deploy pipeline go through here; dispatch only
//! reads.

use std::sync::Arc;

use loom_core::{
    Clock, HttpMethod, LogPage, Route, RouteId, RouteKind, RoutePatch, RouteSpec, RouteStatus,
    RouteStore, Slug,
};
use loom_executor::{compile, DependencyProvisioner, InstallReport};
use serde::Deserialize;

use crate::error::RegistryError;

/// Default and maximum page sizes for execution log listings.
pub const DEFAULT_LOG_LIMIT: u32 = 50;
pub const MAX_LOG_LIMIT: u32 = 200;

/// A route published by the generation pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub name: String,
    /// A slug, or a full dispatch path such as `/api/logic/report`.
    pub path: String,
    #[serde(alias = "sourceCode")]
    pub source: String,
    pub methods: Vec<String>,
}

#[derive(Clone)]
pub struct RouteRegistry {
    store: Arc<dyn RouteStore>,
    provisioner: Arc<DependencyProvisioner>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRegistry").field("provisioner", &self.provisioner).finish_non_exhaustive()
    }
}

impl RouteRegistry {
    #[must_use]
    pub fn new(
        store: Arc<dyn RouteStore>,
        provisioner: Arc<DependencyProvisioner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, provisioner, clock }
    }

    /// Validates and stores a new route, `draft` unless `spec.status` says
    /// otherwise.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] for bad fields,
    /// [`RegistryError::SlugTaken`] if the slug is in use for this kind, and
    /// [`RegistryError::InvalidSource`] if the route is created `active`
    /// with source that does not compile.
    pub async fn register(&self, spec: RouteSpec) -> Result<Route, RegistryError> {
        let route = Route::from_spec(spec, self.clock.now())?;
        if route.status == RouteStatus::Active {
            check_source(&route)?;
        }
        self.ensure_slug_free(route.kind, &route.slug, None).await?;
        self.store.insert_route(&route).await?;
        tracing::info!(route_id = %route.id, slug = %route.slug, kind = %route.kind, "route registered");
        Ok(route)
    }

    /// Applies a partial update.
    ///
    /// # Errors
    /// As [`RouteRegistry::register`], plus [`RegistryError::NotFound`].
    pub async fn update(&self, id: RouteId, patch: RoutePatch) -> Result<Route, RegistryError> {
        let mut route = self.get(id).await?;
        route.apply_patch(patch, self.clock.now())?;
        if route.status == RouteStatus::Active {
            check_source(&route)?;
        }
        self.ensure_slug_free(route.kind, &route.slug, Some(id)).await?;
        self.store.update_route(&route).await?;
        tracing::info!(route_id = %id, slug = %route.slug, status = route.status.as_str(), "route updated");
        Ok(route)
    }

    /// Deletes a route, its logs and usage records, and its installed
    /// modules.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] if the route does not exist.
    pub async fn delete(&self, id: RouteId) -> Result<(), RegistryError> {
        if !self.store.delete_route(id).await? {
            return Err(RegistryError::NotFound(id));
        }
        if let Err(e) = self.provisioner.remove(id).await {
            tracing::warn!(route_id = %id, error = %e, "failed to remove installed modules");
        }
        tracing::info!(route_id = %id, "route deleted");
        Ok(())
    }

    /// # Errors
    /// Returns [`RegistryError::NotFound`] if the route does not exist.
    pub async fn get(&self, id: RouteId) -> Result<Route, RegistryError> {
        self.store.get_route(id).await?.ok_or(RegistryError::NotFound(id))
    }

    /// # Errors
    /// Returns [`RegistryError::Persistence`] on storage failure.
    pub async fn list(&self, kind: Option<RouteKind>) -> Result<Vec<Route>, RegistryError> {
        Ok(self.store.list_routes(kind).await?)
    }

    /// Finds the dispatchable route for `slug`. Draft and inactive routes
    /// are invisible here.
    ///
    /// # Errors
    /// Returns [`RegistryError::Persistence`] on storage failure.
    pub async fn lookup(&self, kind: RouteKind, slug: &str) -> Result<Option<Route>, RegistryError> {
        let route = self.store.find_route(kind, slug).await?;
        Ok(route.filter(Route::is_dispatchable))
    }

    /// Provisions the route's declared dependencies and records which ones
    /// became available. Only the installed list is written back, so edits
    /// made while packages are fetched are kept.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] or [`RegistryError::Provision`]
    /// if the route's module directory cannot be reset.
    pub async fn install_dependencies(
        &self,
        id: RouteId,
    ) -> Result<(Route, InstallReport), RegistryError> {
        let declared = self.get(id).await?.declared_dependencies;
        let report = self.provisioner.install(id, &declared).await?;
        let route = self
            .store
            .set_installed_dependencies(id, &report.installed, self.clock.now())
            .await?;
        Ok((route, report))
    }

    /// Creates or overwrites the route at `path` and activates it.
    ///
    /// An existing route keeps its id, counters, and access policy; its
    /// name, source, and method are replaced.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] for an empty or invalid method
    /// list or path, and [`RegistryError::InvalidSource`] if the source
    /// does not compile.
    pub async fn deploy(&self, request: DeployRequest) -> Result<Route, RegistryError> {
        let (kind, slug) = parse_deploy_path(&request.path);
        let method = primary_method(&request.methods)?;
        let slug = Slug::normalize(slug)?;

        if let Some(mut route) = self.store.find_route(kind, slug.as_str()).await? {
            let patch = RoutePatch {
                name: Some(request.name),
                source_code: Some(request.source),
                http_method: Some(method),
                status: Some(RouteStatus::Active),
                ..RoutePatch::default()
            };
            route.apply_patch(patch, self.clock.now())?;
            check_source(&route)?;
            self.store.update_route(&route).await?;
            tracing::info!(route_id = %route.id, %slug, "route redeployed");
            return Ok(route);
        }

        let spec = RouteSpec {
            kind,
            name: request.name,
            slug: Some(slug.to_string()),
            http_method: method,
            source_code: request.source,
            status: Some(RouteStatus::Active),
            ..RouteSpec::default()
        };
        self.register(spec).await
    }

    /// A page of the route's execution logs, newest first. `limit` defaults
    /// to [`DEFAULT_LOG_LIMIT`] and is clamped to `1..=MAX_LOG_LIMIT`.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] if the route does not exist.
    pub async fn list_logs(
        &self,
        id: RouteId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<LogPage, RegistryError> {
        self.get(id).await?;
        let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
        Ok(self.store.list_logs(id, limit, offset.unwrap_or(0)).await?)
    }

    async fn ensure_slug_free(
        &self,
        kind: RouteKind,
        slug: &Slug,
        owner: Option<RouteId>,
    ) -> Result<(), RegistryError> {
        match self.store.find_route(kind, slug.as_str()).await? {
            Some(existing) if Some(existing.id) != owner => {
                Err(RegistryError::SlugTaken { kind, slug: slug.to_string() })
            }
            _ => Ok(()),
        }
    }
}

fn check_source(route: &Route) -> Result<(), RegistryError> {
    compile(&route.source_code, route.slug.as_str())
        .map(|_| ())
        .map_err(|e| RegistryError::InvalidSource { message: e.to_string() })
}

fn parse_deploy_path(path: &str) -> (RouteKind, &str) {
    let path = path.trim();
    for kind in [RouteKind::Custom, RouteKind::Logic] {
        let prefix = kind.path_prefix();
        if let Some(rest) = path.strip_prefix(prefix).or_else(|| path.strip_prefix(&prefix[1..])) {
            return (kind, rest);
        }
    }
    (RouteKind::Custom, path)
}

fn primary_method(methods: &[String]) -> Result<HttpMethod, RegistryError> {
    let mut parsed = methods.iter().map(|m| m.parse::<HttpMethod>());
    match parsed.next() {
        None => Err(loom_core::CoreError::Validation {
            field: "methods".to_owned(),
            reason: "at least one method is required".to_owned(),
        }
        .into()),
        Some(first) => {
            let first = first?;
            for rest in parsed {
                rest?;
            }
            Ok(first)
        }
    }
}
