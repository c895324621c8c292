//! Fuzz target: admin request bodies.
//!
//! Arbitrary bytes decoded as `RouteSpec` or `RoutePatch` and applied to
//! a route must fail cleanly, never panic. Whatever is accepted must keep
//! a valid slug and a non-zero rate limit.

#![no_main]

use chrono::{TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use loom_core::{Route, RoutePatch, RouteSpec};

fuzz_target!(|data: &[u8]| {
    let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    if let Ok(spec) = serde_json::from_slice::<RouteSpec>(data) {
        if let Ok(route) = Route::from_spec(spec, now) {
            assert_ne!(route.rate_limit_per_day, Some(0));
        }
    }
    if let Ok(patch) = serde_json::from_slice::<RoutePatch>(data) {
        let base = RouteSpec { name: "fuzz".to_owned(), ..RouteSpec::default() };
        let Ok(mut route) = Route::from_spec(base, now) else {
            return;
        };
        if route.apply_patch(patch, now).is_ok() {
            assert_eq!(loom_core::Slug::normalize(route.slug.as_str()).ok().as_ref(), Some(&route.slug));
            assert_ne!(route.rate_limit_per_day, Some(0));
        }
    }
});
