//! In-memory [`RouteStore`] used by tests and single-node deployments
//! that do not need durability.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use loom_core::{
    CallerKey, ExecutionLogEntry, LogPage, Route, RouteId, RouteKind, RouteStore, StoreError,
    UsageRecord,
};

#[derive(Debug, Default)]
struct Tables {
    routes: BTreeMap<RouteId, Route>,
    usage: Vec<UsageRecord>,
    logs: Vec<ExecutionLogEntry>,
}

impl Tables {
    fn slug_owner(&self, kind: RouteKind, slug: &str) -> Option<RouteId> {
        self.routes
            .values()
            .find(|r| r.kind == kind && r.slug.as_str() == slug)
            .map(|r| r.id)
    }
}

/// Thread-safe in-memory store. Each operation takes the lock once.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouteStore for MemoryStore {
    async fn insert_route(&self, route: &Route) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.slug_owner(route.kind, route.slug.as_str()).is_some() {
            return Err(StoreError::SlugTaken { kind: route.kind, slug: route.slug.to_string() });
        }
        tables.routes.insert(route.id, route.clone());
        Ok(())
    }

    async fn update_route(&self, route: &Route) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(owner) = tables.slug_owner(route.kind, route.slug.as_str()) {
            if owner != route.id {
                return Err(StoreError::SlugTaken {
                    kind: route.kind,
                    slug: route.slug.to_string(),
                });
            }
        }
        let stored = tables.routes.get_mut(&route.id).ok_or(StoreError::NotFound(route.id))?;
        let execution_count = stored.execution_count;
        let last_executed_at = stored.last_executed_at;
        *stored = route.clone();
        stored.execution_count = execution_count;
        stored.last_executed_at = last_executed_at;
        Ok(())
    }

    async fn set_installed_dependencies(
        &self,
        id: RouteId,
        installed: &[String],
        updated_at: DateTime<Utc>,
    ) -> Result<Route, StoreError> {
        let mut tables = self.tables.write().await;
        let stored = tables.routes.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        stored.installed_dependencies = installed.to_vec();
        stored.updated_at = updated_at;
        Ok(stored.clone())
    }

    async fn get_route(&self, id: RouteId) -> Result<Option<Route>, StoreError> {
        Ok(self.tables.read().await.routes.get(&id).cloned())
    }

    async fn find_route(&self, kind: RouteKind, slug: &str) -> Result<Option<Route>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .routes
            .values()
            .find(|r| r.kind == kind && r.slug.as_str() == slug)
            .cloned())
    }

    async fn list_routes(&self, kind: Option<RouteKind>) -> Result<Vec<Route>, StoreError> {
        let tables = self.tables.read().await;
        let mut routes: Vec<Route> = tables
            .routes
            .values()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .cloned()
            .collect();
        routes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(routes)
    }

    async fn delete_route(&self, id: RouteId) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.routes.remove(&id).is_none() {
            return Ok(false);
        }
        tables.usage.retain(|u| u.route_id != id);
        tables.logs.retain(|l| l.route_id != id);
        Ok(true)
    }

    async fn count_usage_since(
        &self,
        route_id: RouteId,
        caller: &CallerKey,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        let count = tables
            .usage
            .iter()
            .filter(|u| u.route_id == route_id && &u.caller == caller && u.timestamp > since)
            .count();
        Ok(count as u64)
    }

    async fn oldest_usage_since(
        &self,
        route_id: RouteId,
        caller: &CallerKey,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .usage
            .iter()
            .filter(|u| u.route_id == route_id && &u.caller == caller && u.timestamp > since)
            .map(|u| u.timestamp)
            .min())
    }

    async fn insert_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.routes.contains_key(&record.route_id) {
            return Err(StoreError::NotFound(record.route_id));
        }
        tables.usage.push(record.clone());
        Ok(())
    }

    async fn prune_usage(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let len = tables.usage.len();
        tables.usage.retain(|u| u.timestamp > before);
        Ok((len - tables.usage.len()) as u64)
    }

    async fn record_execution(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let route = tables
            .routes
            .get_mut(&entry.route_id)
            .ok_or(StoreError::NotFound(entry.route_id))?;
        route.execution_count += 1;
        route.last_executed_at = Some(entry.executed_at);
        tables.logs.push(entry.clone());
        Ok(())
    }

    async fn list_logs(
        &self,
        route_id: RouteId,
        limit: u32,
        offset: u32,
    ) -> Result<LogPage, StoreError> {
        let tables = self.tables.read().await;
        let matching: Vec<&ExecutionLogEntry> =
            tables.logs.iter().rev().filter(|l| l.route_id == route_id).collect();
        let total = matching.len() as u64;
        let logs = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(LogPage { logs, total })
    }
}
