//! Behaviour every `RouteStore` backend must share.

use chrono::{Duration, Utc};
use loom_core::{
    CallerKey, ConsoleEntry, ConsoleLevel, ExecutionLogEntry, ExecutionOutcome, HttpMethod,
    RequestSnapshot, Route, RouteKind, RouteSpec, RouteStatus, RouteStore, StoreError,
    UsageRecord, UserId,
};
use loom_store::{MemoryStore, SqliteStore};

fn route(kind: RouteKind, name: &str) -> Route {
    let spec = RouteSpec {
        kind,
        name: name.to_owned(),
        http_method: HttpMethod::Post,
        source_code: "return function() return 1 end".to_owned(),
        dependencies: vec!["strings@1.0".to_owned()],
        rate_limit_per_day: Some(5),
        created_by: Some(UserId::new("op-1")),
        ..RouteSpec::default()
    };
    match Route::from_spec(spec, Utc::now()) {
        Ok(r) => r,
        Err(e) => panic!("from_spec failed: {e}"),
    }
}

fn log_entry(route: &Route, status: u16, at: chrono::DateTime<Utc>) -> ExecutionLogEntry {
    let snapshot = RequestSnapshot {
        method: "POST".to_owned(),
        headers: [("content-type".to_owned(), "application/json".to_owned())].into(),
        body: serde_json::json!({"n": status}),
        query: Default::default(),
        client_ip: "10.0.0.9".to_owned(),
        user_agent: Some("curl/8".to_owned()),
    };
    let outcome = ExecutionOutcome {
        status_code: status,
        execution_time_ms: 3,
        console: vec![ConsoleEntry::new(ConsoleLevel::Log, "hi".to_owned())],
        error_message: None,
        error_stack: None,
        executed_at: at,
    };
    ExecutionLogEntry::new(route.id, snapshot, outcome)
}

fn sqlite() -> SqliteStore {
    match SqliteStore::open_in_memory() {
        Ok(s) => s,
        Err(e) => panic!("sqlite open failed: {e}"),
    }
}

async fn insert(store: &dyn RouteStore, route: &Route) {
    if let Err(e) = store.insert_route(route).await {
        panic!("insert failed: {e}");
    }
}

// ── Shared scenarios ────────────────────────────────────────────────────────

async fn round_trips_routes(store: &dyn RouteStore) {
    let r = route(RouteKind::Custom, "Echo");
    insert(store, &r).await;

    let fetched = match store.get_route(r.id).await {
        Ok(Some(f)) => f,
        other => panic!("expected route, got {other:?}"),
    };
    assert_eq!(fetched, r);

    let by_slug = match store.find_route(RouteKind::Custom, "echo").await {
        Ok(found) => found,
        Err(e) => panic!("find failed: {e}"),
    };
    assert_eq!(by_slug.map(|f| f.id), Some(r.id));
    assert!(matches!(store.find_route(RouteKind::Logic, "echo").await, Ok(None)));
}

async fn slugs_are_unique_per_kind(store: &dyn RouteStore) {
    let first = route(RouteKind::Custom, "shared");
    insert(store, &first).await;

    let clash = route(RouteKind::Custom, "shared");
    assert!(matches!(store.insert_route(&clash).await, Err(StoreError::SlugTaken { .. })));

    let other_kind = route(RouteKind::Logic, "shared");
    insert(store, &other_kind).await;

    let mut renamed = route(RouteKind::Custom, "other");
    insert(store, &renamed).await;
    renamed.slug = first.slug.clone();
    assert!(matches!(store.update_route(&renamed).await, Err(StoreError::SlugTaken { .. })));
}

async fn update_preserves_counters(store: &dyn RouteStore) {
    let r = route(RouteKind::Custom, "counted");
    insert(store, &r).await;
    let at = Utc::now();
    if let Err(e) = store.record_execution(&log_entry(&r, 200, at)).await {
        panic!("record failed: {e}");
    }

    let mut stale = r.clone();
    stale.status = RouteStatus::Active;
    stale.source_code = "return function() return 2 end".to_owned();
    stale.execution_count = 0;
    stale.last_executed_at = None;
    if let Err(e) = store.update_route(&stale).await {
        panic!("update failed: {e}");
    }

    let fetched = match store.get_route(r.id).await {
        Ok(Some(f)) => f,
        other => panic!("expected route, got {other:?}"),
    };
    assert_eq!(fetched.status, RouteStatus::Active);
    assert_eq!(fetched.source_code, stale.source_code);
    assert_eq!(fetched.execution_count, 1);
    assert!(fetched.last_executed_at.is_some());

    let ghost = route(RouteKind::Custom, "ghost");
    assert!(matches!(store.update_route(&ghost).await, Err(StoreError::NotFound(_))));
}

async fn installed_list_update_touches_nothing_else(store: &dyn RouteStore) {
    let r = route(RouteKind::Custom, "provisioned");
    insert(store, &r).await;
    if let Err(e) = store.record_execution(&log_entry(&r, 200, Utc::now())).await {
        panic!("record failed: {e}");
    }
    let mut edited = r.clone();
    edited.source_code = "return function() return 'edited' end".to_owned();
    edited.status = RouteStatus::Active;
    if let Err(e) = store.update_route(&edited).await {
        panic!("update failed: {e}");
    }

    let at = Utc::now() + Duration::seconds(5);
    let installed = vec!["strings@1.0".to_owned()];
    let returned = match store.set_installed_dependencies(r.id, &installed, at).await {
        Ok(route) => route,
        Err(e) => panic!("set_installed_dependencies failed: {e}"),
    };
    let fetched = match store.get_route(r.id).await {
        Ok(Some(f)) => f,
        other => panic!("expected route, got {other:?}"),
    };
    assert_eq!(returned, fetched);
    assert_eq!(fetched.installed_dependencies, installed);
    assert_eq!(fetched.updated_at.timestamp_millis(), at.timestamp_millis());
    assert_eq!(fetched.source_code, edited.source_code);
    assert_eq!(fetched.status, RouteStatus::Active);
    assert_eq!(fetched.execution_count, 1);

    let ghost = route(RouteKind::Custom, "ghost");
    assert!(matches!(
        store.set_installed_dependencies(ghost.id, &installed, at).await,
        Err(StoreError::NotFound(_))
    ));
}

async fn usage_window_counts_strictly_after(store: &dyn RouteStore) {
    let r = route(RouteKind::Custom, "limited");
    insert(store, &r).await;
    let caller = CallerKey::User(UserId::new("u1"));
    let anon = CallerKey::Address("u1".to_owned());
    let now = Utc::now();

    for offset in [30, 20, 10] {
        let rec = UsageRecord::new(r.id, caller.clone(), now - Duration::hours(offset));
        if let Err(e) = store.insert_usage(&rec).await {
            panic!("insert usage failed: {e}");
        }
    }

    let since = now - Duration::hours(24);
    assert_eq!(store.count_usage_since(r.id, &caller, since).await.ok(), Some(2));
    assert_eq!(store.count_usage_since(r.id, &anon, since).await.ok(), Some(0));

    let oldest = match store.oldest_usage_since(r.id, &caller, since).await {
        Ok(o) => o,
        Err(e) => panic!("oldest failed: {e}"),
    };
    let expected = now - Duration::hours(20);
    let delta = oldest.map(|o| (o - expected).num_milliseconds().abs());
    assert!(matches!(delta, Some(d) if d <= 1), "unexpected oldest {oldest:?}");

    assert_eq!(store.prune_usage(since).await.ok(), Some(1));
    assert_eq!(store.count_usage_since(r.id, &caller, now - Duration::days(7)).await.ok(), Some(2));
}

async fn usage_for_missing_route_is_rejected(store: &dyn RouteStore) {
    let r = route(RouteKind::Custom, "never-stored");
    let rec = UsageRecord::new(r.id, CallerKey::Address("1.2.3.4".to_owned()), Utc::now());
    assert!(matches!(store.insert_usage(&rec).await, Err(StoreError::NotFound(_))));
}

async fn logs_page_newest_first(store: &dyn RouteStore) {
    let r = route(RouteKind::Logic, "paged");
    insert(store, &r).await;
    let start = Utc::now();
    for i in 0..5u16 {
        let entry = log_entry(&r, 200 + i, start + Duration::seconds(i64::from(i)));
        if let Err(e) = store.record_execution(&entry).await {
            panic!("record failed: {e}");
        }
    }

    let page = match store.list_logs(r.id, 2, 1).await {
        Ok(p) => p,
        Err(e) => panic!("list failed: {e}"),
    };
    assert_eq!(page.total, 5);
    let statuses: Vec<u16> = page.logs.iter().map(|l| l.status_code).collect();
    assert_eq!(statuses, vec![203, 202]);
    assert_eq!(page.logs[0].console_capture.len(), 1);

    let fetched = match store.get_route(r.id).await {
        Ok(Some(f)) => f,
        other => panic!("expected route, got {other:?}"),
    };
    assert_eq!(fetched.execution_count, 5);
}

async fn delete_cascades(store: &dyn RouteStore) {
    let r = route(RouteKind::Custom, "doomed");
    insert(store, &r).await;
    let caller = CallerKey::Address("9.9.9.9".to_owned());
    if let Err(e) = store.insert_usage(&UsageRecord::new(r.id, caller.clone(), Utc::now())).await {
        panic!("insert usage failed: {e}");
    }
    if let Err(e) = store.record_execution(&log_entry(&r, 200, Utc::now())).await {
        panic!("record failed: {e}");
    }

    assert_eq!(store.delete_route(r.id).await.ok(), Some(true));
    assert_eq!(store.delete_route(r.id).await.ok(), Some(false));
    assert!(matches!(store.get_route(r.id).await, Ok(None)));
    let since = Utc::now() - Duration::days(1);
    assert_eq!(store.count_usage_since(r.id, &caller, since).await.ok(), Some(0));
    assert_eq!(store.list_logs(r.id, 50, 0).await.ok().map(|p| p.total), Some(0));
    assert!(matches!(
        store.record_execution(&log_entry(&r, 200, Utc::now())).await,
        Err(StoreError::NotFound(_))
    ));
}

async fn list_filters_by_kind(store: &dyn RouteStore) {
    insert(store, &route(RouteKind::Custom, "a")).await;
    insert(store, &route(RouteKind::Logic, "b")).await;
    insert(store, &route(RouteKind::Custom, "c")).await;

    let all = store.list_routes(None).await.ok().map(|v| v.len());
    assert_eq!(all, Some(3));
    let logic = match store.list_routes(Some(RouteKind::Logic)).await {
        Ok(v) => v,
        Err(e) => panic!("list failed: {e}"),
    };
    assert_eq!(logic.len(), 1);
    assert_eq!(logic[0].slug.as_str(), "b");
}

macro_rules! conformance {
    ($($scenario:ident),* $(,)?) => {
        mod memory {
            $(
                #[tokio::test]
                async fn $scenario() {
                    super::$scenario(&super::MemoryStore::new()).await;
                }
            )*
        }

        mod sqlite {
            $(
                #[tokio::test]
                async fn $scenario() {
                    super::$scenario(&super::sqlite()).await;
                }
            )*
        }
    };
}

conformance!(
    round_trips_routes,
    slugs_are_unique_per_kind,
    update_preserves_counters,
    installed_list_update_touches_nothing_else,
    usage_window_counts_strictly_after,
    usage_for_missing_route_is_rejected,
    logs_page_newest_first,
    delete_cascades,
    list_filters_by_kind,
);

#[tokio::test]
async fn sqlite_file_survives_reopen() {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir failed: {e}"),
    };
    let path = dir.path().join("loom.db");
    let r = route(RouteKind::Custom, "durable");
    {
        let store = match SqliteStore::open(&path) {
            Ok(s) => s,
            Err(e) => panic!("open failed: {e}"),
        };
        insert(&store, &r).await;
    }
    let reopened = match SqliteStore::open(&path) {
        Ok(s) => s,
        Err(e) => panic!("reopen failed: {e}"),
    };
    assert!(matches!(reopened.get_route(r.id).await, Ok(Some(_))));
}
