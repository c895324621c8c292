//! The access control gate.
//!
//! A request moves through `MethodCheck -> AuthCheck -> TierCheck` and is
//! either admitted or rejected at the first failing check. Rejections have
//! no side effects: nothing is logged against the route and no usage is
//! counted.

use std::sync::Arc;

use axum::http::{HeaderMap, Method};
use loom_core::{Identity, PlanAccessTier, Route, SubscriptionTier};

use crate::error::DispatchError;
use crate::identity::{IdentityResolver, PlanDirectory};

/// A caller that passed every check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Admission {
    pub identity: Option<Identity>,
    /// Known whenever `identity` is.
    pub tier: Option<SubscriptionTier>,
}

/// Checks a request against a route's access policy.
#[derive(Clone)]
pub struct AccessGate {
    identities: Arc<dyn IdentityResolver>,
    plans: Arc<dyn PlanDirectory>,
    upgrade_url: String,
}

impl std::fmt::Debug for AccessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGate").field("upgrade_url", &self.upgrade_url).finish_non_exhaustive()
    }
}

impl AccessGate {
    #[must_use]
    pub fn new(
        identities: Arc<dyn IdentityResolver>,
        plans: Arc<dyn PlanDirectory>,
        upgrade_url: impl Into<String>,
    ) -> Self {
        Self { identities, plans, upgrade_url: upgrade_url.into() }
    }

    /// Runs the checks in order.
    ///
    /// The caller is resolved even for public routes so handlers and the
    /// rate limiter can see who is calling.
    ///
    /// # Errors
    /// Returns [`DispatchError::MethodMismatch`],
    /// [`DispatchError::Unauthenticated`] or
    /// [`DispatchError::PlanTierInsufficient`].
    pub async fn admit(
        &self,
        route: &Route,
        method: &Method,
        headers: &HeaderMap,
    ) -> Result<Admission, DispatchError> {
        method_check(route, method)?;

        let identity = self.identities.resolve(headers).await;
        let Some(identity) = identity else {
            return if route.requires_identity() {
                Err(DispatchError::Unauthenticated)
            } else {
                Ok(Admission::default())
            };
        };

        let tier = self.plans.plan_tier(&identity).await;
        self.tier_check(route, &tier)?;
        Ok(Admission { identity: Some(identity), tier: Some(tier) })
    }

    fn tier_check(&self, route: &Route, tier: &SubscriptionTier) -> Result<(), DispatchError> {
        if route.plan_access_tier == PlanAccessTier::PaidOnly && !tier.is_paid() {
            return Err(DispatchError::PlanTierInsufficient {
                required: route.plan_access_tier,
                plan: tier.plan().to_owned(),
                upgrade_url: self.upgrade_url.clone(),
            });
        }
        Ok(())
    }
}

fn method_check(route: &Route, method: &Method) -> Result<(), DispatchError> {
    if method.as_str() == route.http_method.as_str() {
        return Ok(());
    }
    Err(DispatchError::MethodMismatch {
        slug: route.slug.to_string(),
        expected: route.http_method,
        actual: method.as_str().to_owned(),
    })
}
