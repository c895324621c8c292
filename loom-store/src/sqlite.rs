//! `SQLite`-backed [`RouteStore`].
//!
//! One connection guarded by a mutex, only ever locked from inside
//! `spawn_blocking`. Usage timestamps are stored as epoch milliseconds so
//! the window queries stay on an integer index.

use std::os::raw::c_int;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use loom_core::{
    CallerKey, ExecutionLogEntry, LogPage, Route, RouteId, RouteKind, RouteStore, Slug,
    StoreError, UsageRecord, UserId,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS routes (
    id                     TEXT PRIMARY KEY,
    kind                   TEXT NOT NULL,
    name                   TEXT NOT NULL,
    slug                   TEXT NOT NULL,
    http_method            TEXT NOT NULL,
    description            TEXT NOT NULL,
    source_code            TEXT NOT NULL,
    declared_dependencies  TEXT NOT NULL,
    installed_dependencies TEXT NOT NULL,
    status                 TEXT NOT NULL,
    auth_required          INTEGER NOT NULL,
    plan_access_tier       TEXT NOT NULL,
    rate_limit_per_day     INTEGER,
    execution_count        INTEGER NOT NULL DEFAULT 0,
    last_executed_at       TEXT,
    created_by             TEXT,
    created_at             TEXT NOT NULL,
    updated_at             TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS routes_kind_slug ON routes (kind, slug);

CREATE TABLE IF NOT EXISTS usage_records (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    route_id  TEXT NOT NULL REFERENCES routes (id) ON DELETE CASCADE,
    caller    TEXT NOT NULL,
    ts_millis INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS usage_window ON usage_records (route_id, caller, ts_millis);
CREATE INDEX IF NOT EXISTS usage_ts ON usage_records (ts_millis);

CREATE TABLE IF NOT EXISTS execution_logs (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    route_id    TEXT NOT NULL REFERENCES routes (id) ON DELETE CASCADE,
    executed_at TEXT NOT NULL,
    entry       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS logs_by_route ON execution_logs (route_id, seq);
";

const ROUTE_COLUMNS: &str = "id, kind, name, slug, http_method, description, source_code, \
     declared_dependencies, installed_dependencies, status, auth_required, plan_access_tier, \
     rate_limit_per_day, execution_count, last_executed_at, created_by, created_at, updated_at";

/// Durable store backed by a single `SQLite` database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` in WAL mode and applies
    /// the schema.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] if the file cannot be opened or the
    /// schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(backend)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(backend)?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        tracing::debug!("sqlite schema ready");
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_owned()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite task failed: {e}")))?
    }
}

// ── Error mapping ───────────────────────────────────────────────────────────

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_constraint(e: &rusqlite::Error, code: c_int) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.extended_code == code)
}

fn slug_taken(route: &Route) -> StoreError {
    StoreError::SlugTaken { kind: route.kind, slug: route.slug.to_string() }
}

fn write_route_error(e: rusqlite::Error, route: &Route) -> StoreError {
    if is_constraint(&e, rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE) {
        slug_taken(route)
    } else {
        backend(e)
    }
}

// ── Row mapping ─────────────────────────────────────────────────────────────

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion(idx, e))
}

fn json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion(idx, e))
}

fn route_from_row(row: &Row<'_>) -> rusqlite::Result<Route> {
    let slug: String = row.get(3)?;
    let execution_count: i64 = row.get(13)?;
    let rate_limit: Option<i64> = row.get(12)?;
    Ok(Route {
        id: parsed(row, 0)?,
        kind: parsed(row, 1)?,
        name: row.get(2)?,
        slug: Slug::normalize(&slug).map_err(|e| conversion(3, e))?,
        http_method: parsed(row, 4)?,
        description: row.get(5)?,
        source_code: row.get(6)?,
        declared_dependencies: json_list(row, 7)?,
        installed_dependencies: json_list(row, 8)?,
        status: parsed(row, 9)?,
        auth_required: row.get(10)?,
        plan_access_tier: parsed(row, 11)?,
        rate_limit_per_day: rate_limit.and_then(|n| u32::try_from(n).ok()),
        execution_count: u64::try_from(execution_count).unwrap_or(0),
        last_executed_at: row.get(14)?,
        created_by: row.get::<_, Option<String>>(15)?.map(UserId::from),
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn to_json(list: &[String]) -> Result<String, StoreError> {
    serde_json::to_string(list).map_err(|e| StoreError::Backend(e.to_string()))
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[async_trait]
impl RouteStore for SqliteStore {
    async fn insert_route(&self, route: &Route) -> Result<(), StoreError> {
        let route = route.clone();
        self.with_conn(move |conn| {
            let declared = to_json(&route.declared_dependencies)?;
            let installed = to_json(&route.installed_dependencies)?;
            conn.execute(
                &format!(
                    "INSERT INTO routes ({ROUTE_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    route.id.to_string(),
                    route.kind.as_str(),
                    route.name,
                    route.slug.as_str(),
                    route.http_method.as_str(),
                    route.description,
                    route.source_code,
                    declared,
                    installed,
                    route.status.as_str(),
                    route.auth_required,
                    route.plan_access_tier.as_str(),
                    route.rate_limit_per_day,
                    i64::try_from(route.execution_count).unwrap_or(i64::MAX),
                    route.last_executed_at,
                    route.created_by.as_ref().map(UserId::as_str),
                    route.created_at,
                    route.updated_at,
                ],
            )
            .map_err(|e| write_route_error(e, &route))?;
            Ok(())
        })
        .await
    }

    async fn update_route(&self, route: &Route) -> Result<(), StoreError> {
        let route = route.clone();
        self.with_conn(move |conn| {
            let declared = to_json(&route.declared_dependencies)?;
            let installed = to_json(&route.installed_dependencies)?;
            let changed = conn
                .execute(
                    "UPDATE routes SET kind = ?2, name = ?3, slug = ?4, http_method = ?5, \
                     description = ?6, source_code = ?7, declared_dependencies = ?8, \
                     installed_dependencies = ?9, status = ?10, auth_required = ?11, \
                     plan_access_tier = ?12, rate_limit_per_day = ?13, created_by = ?14, \
                     created_at = ?15, updated_at = ?16 WHERE id = ?1",
                    params![
                        route.id.to_string(),
                        route.kind.as_str(),
                        route.name,
                        route.slug.as_str(),
                        route.http_method.as_str(),
                        route.description,
                        route.source_code,
                        declared,
                        installed,
                        route.status.as_str(),
                        route.auth_required,
                        route.plan_access_tier.as_str(),
                        route.rate_limit_per_day,
                        route.created_by.as_ref().map(UserId::as_str),
                        route.created_at,
                        route.updated_at,
                    ],
                )
                .map_err(|e| write_route_error(e, &route))?;
            if changed == 0 {
                return Err(StoreError::NotFound(route.id));
            }
            Ok(())
        })
        .await
    }

    async fn set_installed_dependencies(
        &self,
        id: RouteId,
        installed: &[String],
        updated_at: DateTime<Utc>,
    ) -> Result<Route, StoreError> {
        let installed = to_json(installed)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let changed = tx
                .execute(
                    "UPDATE routes SET installed_dependencies = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id.to_string(), installed, updated_at],
                )
                .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
            let route = tx
                .query_row(
                    &format!("SELECT {ROUTE_COLUMNS} FROM routes WHERE id = ?1"),
                    params![id.to_string()],
                    route_from_row,
                )
                .map_err(backend)?;
            tx.commit().map_err(backend)?;
            Ok(route)
        })
        .await
    }

    async fn get_route(&self, id: RouteId) -> Result<Option<Route>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ROUTE_COLUMNS} FROM routes WHERE id = ?1"),
                params![id.to_string()],
                route_from_row,
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn find_route(&self, kind: RouteKind, slug: &str) -> Result<Option<Route>, StoreError> {
        let slug = slug.to_owned();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ROUTE_COLUMNS} FROM routes WHERE kind = ?1 AND slug = ?2"),
                params![kind.as_str(), slug],
                route_from_row,
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn list_routes(&self, kind: Option<RouteKind>) -> Result<Vec<Route>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ROUTE_COLUMNS} FROM routes \
                     WHERE ?1 IS NULL OR kind = ?1 ORDER BY created_at, id"
                ))
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![kind.map(RouteKind::as_str)], route_from_row)
                .map_err(backend)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
        })
        .await
    }

    async fn delete_route(&self, id: RouteId) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM routes WHERE id = ?1", params![id.to_string()])
                .map_err(backend)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn count_usage_since(
        &self,
        route_id: RouteId,
        caller: &CallerKey,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let caller = caller.storage_key();
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM usage_records \
                     WHERE route_id = ?1 AND caller = ?2 AND ts_millis > ?3",
                    params![route_id.to_string(), caller, millis(since)],
                    |row| row.get(0),
                )
                .map_err(backend)?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn oldest_usage_since(
        &self,
        route_id: RouteId,
        caller: &CallerKey,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let caller = caller.storage_key();
        self.with_conn(move |conn| {
            let oldest: Option<i64> = conn
                .query_row(
                    "SELECT MIN(ts_millis) FROM usage_records \
                     WHERE route_id = ?1 AND caller = ?2 AND ts_millis > ?3",
                    params![route_id.to_string(), caller, millis(since)],
                    |row| row.get(0),
                )
                .map_err(backend)?;
            Ok(oldest.and_then(from_millis))
        })
        .await
    }

    async fn insert_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO usage_records (route_id, caller, ts_millis) VALUES (?1, ?2, ?3)",
                params![
                    record.route_id.to_string(),
                    record.caller.storage_key(),
                    millis(record.timestamp)
                ],
            )
            .map_err(|e| {
                if is_constraint(&e, rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY) {
                    StoreError::NotFound(record.route_id)
                } else {
                    backend(e)
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn prune_usage(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM usage_records WHERE ts_millis <= ?1",
                    params![millis(before)],
                )
                .map_err(backend)?;
            Ok(removed as u64)
        })
        .await
    }

    async fn record_execution(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            let body =
                serde_json::to_string(&entry).map_err(|e| StoreError::Backend(e.to_string()))?;
            let tx = conn.transaction().map_err(backend)?;
            let updated = tx
                .execute(
                    "UPDATE routes SET execution_count = execution_count + 1, \
                     last_executed_at = ?2 WHERE id = ?1",
                    params![entry.route_id.to_string(), entry.executed_at],
                )
                .map_err(backend)?;
            if updated == 0 {
                return Err(StoreError::NotFound(entry.route_id));
            }
            tx.execute(
                "INSERT INTO execution_logs (id, route_id, executed_at, entry) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![entry.id.to_string(), entry.route_id.to_string(), entry.executed_at, body],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)
        })
        .await
    }

    async fn list_logs(
        &self,
        route_id: RouteId,
        limit: u32,
        offset: u32,
    ) -> Result<LogPage, StoreError> {
        self.with_conn(move |conn| {
            let total: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM execution_logs WHERE route_id = ?1",
                    params![route_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(backend)?;
            let mut stmt = conn
                .prepare(
                    "SELECT entry FROM execution_logs WHERE route_id = ?1 \
                     ORDER BY seq DESC LIMIT ?2 OFFSET ?3",
                )
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![route_id.to_string(), limit, offset], |row| {
                    let raw: String = row.get(0)?;
                    serde_json::from_str::<ExecutionLogEntry>(&raw).map_err(|e| conversion(0, e))
                })
                .map_err(backend)?;
            let logs = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)?;
            Ok(LogPage { logs, total: u64::try_from(total).unwrap_or(0) })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_millis_round_trip() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).single();
        let Some(now) = now else { panic!("valid timestamp") };
        assert_eq!(from_millis(millis(now)), Some(now));
    }

    #[test]
    fn open_in_memory_applies_schema() {
        let store = match SqliteStore::open_in_memory() {
            Ok(s) => s,
            Err(e) => panic!("open failed: {e}"),
        };
        let guard = match store.conn.lock() {
            Ok(g) => g,
            Err(e) => panic!("lock poisoned: {e}"),
        };
        let tables: i64 = match guard.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('routes', 'usage_records', 'execution_logs')",
            [],
            |row| row.get(0),
        ) {
            Ok(n) => n,
            Err(e) => panic!("query failed: {e}"),
        };
        assert_eq!(tables, 3);
    }
}
