//! Shared handler state: every component a request may touch.

use std::sync::Arc;

use loom_core::{Clock, RouteStore};
use loom_executor::{DependencyProvisioner, PackageSource, Sandbox};

use crate::access::AccessGate;
use crate::config::LoomConfig;
use crate::identity::{IdentityResolver, PlanDirectory};
use crate::logger::ExecutionLogger;
use crate::ratelimit::RateLimiter;
use crate::registry::RouteRegistry;

/// Axum state type.
pub type SharedEngine = Arc<Engine>;

/// External collaborators the engine is assembled from.
pub struct EngineParts {
    pub store: Arc<dyn RouteStore>,
    pub clock: Arc<dyn Clock>,
    pub identities: Arc<dyn IdentityResolver>,
    pub plans: Arc<dyn PlanDirectory>,
    pub packages: Arc<dyn PackageSource>,
}

#[derive(Debug)]
pub struct Engine {
    pub config: Arc<LoomConfig>,
    pub registry: RouteRegistry,
    pub gate: AccessGate,
    pub limiter: RateLimiter,
    pub provisioner: Arc<DependencyProvisioner>,
    pub sandbox: Sandbox,
    pub logger: ExecutionLogger,
}

impl Engine {
    #[must_use]
    pub fn new(config: Arc<LoomConfig>, parts: EngineParts) -> Self {
        let EngineParts { store, clock, identities, plans, packages } = parts;
        let provisioner =
            Arc::new(DependencyProvisioner::new(packages, config.packages.modules_dir.clone()));
        Self {
            registry: RouteRegistry::new(
                Arc::clone(&store),
                Arc::clone(&provisioner),
                Arc::clone(&clock),
            ),
            gate: AccessGate::new(identities, plans, config.plans.upgrade_url.clone()),
            limiter: RateLimiter::new(Arc::clone(&store), Arc::clone(&clock)),
            logger: ExecutionLogger::new(store, clock),
            sandbox: Sandbox::new(config.sandbox.max_concurrent),
            provisioner,
            config,
        }
    }

    #[must_use]
    pub fn shared(self) -> SharedEngine {
        Arc::new(self)
    }
}
