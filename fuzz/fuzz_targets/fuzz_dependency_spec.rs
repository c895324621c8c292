//! Fuzz target: `name@version` dependency declarations.

#![no_main]

use libfuzzer_sys::fuzz_target;
use loom_core::DependencySpec;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(dep) = DependencySpec::parse(raw) {
        assert!(!dep.name.is_empty());
        assert!(!dep.name.contains('@'));
        assert!(dep.version.as_deref().map_or(true, |v| !v.contains('/')));
    }
});
