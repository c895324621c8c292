//! The module-resolution capability handed to each sandbox.

use std::collections::BTreeMap;
use std::sync::Arc;

use loom_core::RouteId;

use crate::builtins::BuiltinModule;

/// The packages installed for one route, keyed by `require` name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSet {
    route_id: Option<RouteId>,
    modules: BTreeMap<String, Arc<str>>,
}

impl ModuleSet {
    /// An empty set owned by `route_id`.
    #[must_use]
    pub fn new(route_id: RouteId) -> Self {
        Self { route_id: Some(route_id), modules: BTreeMap::new() }
    }

    /// Adds (or replaces) a package's source.
    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<Arc<str>>) {
        self.modules.insert(name.into(), source.into());
    }

    #[must_use]
    pub fn route_id(&self) -> Option<RouteId> {
        self.route_id
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<str>> {
        self.modules.get(name)
    }

    /// Installed package names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// What a `require` name resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Builtin(BuiltinModule),
    Package(Arc<str>),
}

/// Allow-list for `require`: the safe built-ins, then the route's own
/// installed packages. Nothing else resolves, and there is no fallback to
/// host-wide modules.
#[derive(Debug, Clone, Default)]
pub struct ModuleResolver {
    packages: Arc<ModuleSet>,
}

impl ModuleResolver {
    /// A resolver over `packages`.
    #[must_use]
    pub fn new(packages: Arc<ModuleSet>) -> Self {
        Self { packages }
    }

    /// A resolver that only knows the built-ins.
    #[must_use]
    pub fn builtins_only() -> Self {
        Self::default()
    }

    /// Resolves a `require` name. Built-ins shadow packages of the same name.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Resolution> {
        if let Some(builtin) = BuiltinModule::from_name(name) {
            return Some(Resolution::Builtin(builtin));
        }
        self.packages.get(name).map(|src| Resolution::Package(Arc::clone(src)))
    }

    #[must_use]
    pub fn packages(&self) -> &ModuleSet {
        &self.packages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve_without_packages() {
        let resolver = ModuleResolver::builtins_only();
        assert_eq!(resolver.resolve("crypto"), Some(Resolution::Builtin(BuiltinModule::Crypto)));
        assert_eq!(resolver.resolve("lodash"), None);
        assert_eq!(resolver.resolve("os"), None);
    }

    #[test]
    fn installed_packages_resolve_and_builtins_shadow_them() {
        let mut set = ModuleSet::new(RouteId::new());
        set.insert("strings", "return {}");
        set.insert("url", "return { hijacked = true }");
        let resolver = ModuleResolver::new(Arc::new(set));
        assert!(matches!(resolver.resolve("strings"), Some(Resolution::Package(_))));
        assert_eq!(resolver.resolve("url"), Some(Resolution::Builtin(BuiltinModule::Url)));
    }
}
