//! Persistence port for routes, usage records, and execution logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::id::RouteId;
use crate::log::{ExecutionLogEntry, LogPage};
use crate::route::{Route, RouteKind};
use crate::usage::{CallerKey, UsageRecord};

/// Transactional storage for the engine's three entities.
///
/// Every method is one short-lived transaction. Implementations must not
/// hold a lock across an `.await` in the caller.
///
/// # Cancel Safety
/// All methods are cancel safe: a dropped future either committed its
/// transaction or left no trace.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Inserts a new route.
    ///
    /// # Errors
    /// Returns [`StoreError::SlugTaken`] if another route of the same kind
    /// already owns the slug.
    async fn insert_route(&self, route: &Route) -> Result<(), StoreError>;

    /// Replaces every field of an existing route except `execution_count`
    /// and `last_executed_at`, which keep their stored values.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the id is unknown, or
    /// [`StoreError::SlugTaken`] if the new slug collides.
    async fn update_route(&self, route: &Route) -> Result<(), StoreError>;

    /// Sets `installed_dependencies` and `updated_at` and leaves every other
    /// field as stored. Returns the route after the change.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the id is unknown.
    async fn set_installed_dependencies(
        &self,
        id: RouteId,
        installed: &[String],
        updated_at: DateTime<Utc>,
    ) -> Result<Route, StoreError>;

    /// Fetches a route by id.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn get_route(&self, id: RouteId) -> Result<Option<Route>, StoreError>;

    /// Fetches a route by its kind and slug, regardless of status.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn find_route(&self, kind: RouteKind, slug: &str) -> Result<Option<Route>, StoreError>;

    /// Lists routes ordered by creation time, optionally filtered by kind.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn list_routes(&self, kind: Option<RouteKind>) -> Result<Vec<Route>, StoreError>;

    /// Deletes a route together with its usage records and execution logs.
    /// Returns `false` if the route did not exist.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn delete_route(&self, id: RouteId) -> Result<bool, StoreError>;

    /// Counts usage records for `(route, caller)` with `timestamp > since`.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn count_usage_since(
        &self,
        route_id: RouteId,
        caller: &CallerKey,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Returns the oldest usage timestamp for `(route, caller)` after `since`.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn oldest_usage_since(
        &self,
        route_id: RouteId,
        caller: &CallerKey,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Appends a usage record.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the route no longer exists.
    async fn insert_usage(&self, record: &UsageRecord) -> Result<(), StoreError>;

    /// Deletes usage records with `timestamp <= before`; returns how many.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn prune_usage(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Appends an execution log entry and, in the same transaction,
    /// increments the route's `execution_count` and sets `last_executed_at`
    /// to the entry's `executed_at`.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the route was deleted meanwhile.
    async fn record_execution(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError>;

    /// Lists a route's execution logs, newest first.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn list_logs(
        &self,
        route_id: RouteId,
        limit: u32,
        offset: u32,
    ) -> Result<LogPage, StoreError>;
}
