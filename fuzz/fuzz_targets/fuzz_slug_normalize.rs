//! Fuzz target: slug normalization.
//!
//! Any accepted slug must match `[a-z0-9]+(-[a-z0-9]+)*` and normalize
//! to itself.

#![no_main]

use libfuzzer_sys::fuzz_target;
use loom_core::Slug;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(slug) = Slug::normalize(raw) else {
        return;
    };
    let s = slug.as_str();
    assert!(!s.is_empty());
    assert!(!s.starts_with('-') && !s.ends_with('-'), "untrimmed slug {s:?}");
    assert!(!s.contains("--"), "doubled hyphen in {s:?}");
    assert!(s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-'));

    let again = Slug::normalize(s).expect("a normalized slug must be accepted");
    assert_eq!(again, slug, "normalization must be idempotent");
});
