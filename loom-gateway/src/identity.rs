//! Caller identity and subscription lookups.
//!
//! Both are ports: the host application owns sessions and billing, the
//! gateway only asks who is calling and what plan they are on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use loom_core::{Identity, SubscriptionTier, UserId};
use serde::Deserialize;

use crate::config::{AuthConfig, PlansConfig};

/// Resolves the caller of a request from its session credentials.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Returns `None` for anonymous callers and for invalid credentials.
    async fn resolve(&self, headers: &HeaderMap) -> Option<Identity>;
}

/// Reports a user's current subscription.
#[async_trait]
pub trait PlanDirectory: Send + Sync {
    async fn plan_tier(&self, identity: &Identity) -> SubscriptionTier;
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
}

/// Validates HS256 session tokens from `Authorization: Bearer` or the
/// session cookie. The identity is the `sub` claim.
pub struct JwtSessionResolver {
    key: DecodingKey,
    validation: Validation,
    cookie: String,
}

impl std::fmt::Debug for JwtSessionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSessionResolver").field("cookie", &self.cookie).finish_non_exhaustive()
    }
}

impl JwtSessionResolver {
    #[must_use]
    pub fn new(secret: &[u8], cookie: impl Into<String>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            cookie: cookie.into(),
        }
    }

    fn token<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());
        bearer.or_else(|| cookie_value(headers, &self.cookie))
    }
}

#[async_trait]
impl IdentityResolver for JwtSessionResolver {
    async fn resolve(&self, headers: &HeaderMap) -> Option<Identity> {
        let token = self.token(headers)?;
        match decode::<SessionClaims>(token, &self.key, &self.validation) {
            Ok(data) if !data.claims.sub.is_empty() => Some(Identity::new(data.claims.sub)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "rejected session token");
                None
            }
        }
    }
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

/// Treats every caller as anonymous. Used when no session secret is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSessions;

#[async_trait]
impl IdentityResolver for NoSessions {
    async fn resolve(&self, _headers: &HeaderMap) -> Option<Identity> {
        None
    }
}

/// Picks the resolver matching the auth configuration.
#[must_use]
pub fn resolver_from_config(auth: &AuthConfig) -> Arc<dyn IdentityResolver> {
    match &auth.jwt_secret {
        Some(secret) => {
            Arc::new(JwtSessionResolver::new(secret.as_bytes(), auth.session_cookie.clone()))
        }
        None => {
            tracing::warn!("auth.jwt_secret is not set; every caller is anonymous");
            Arc::new(NoSessions)
        }
    }
}

// ── Plans ─────────────────────────────────────────────────────────────────────

/// Plan assignments held in configuration.
///
/// Unknown users are on the default plan, which is the only free tier.
#[derive(Debug, Clone)]
pub struct StaticPlanDirectory {
    default_plan: String,
    assignments: HashMap<UserId, String>,
}

impl StaticPlanDirectory {
    #[must_use]
    pub fn new(default_plan: impl Into<String>) -> Self {
        Self { default_plan: default_plan.into(), assignments: HashMap::new() }
    }

    #[must_use]
    pub fn assign(mut self, user: impl Into<UserId>, plan: impl Into<String>) -> Self {
        self.assignments.insert(user.into(), plan.into());
        self
    }

    #[must_use]
    pub fn from_config(plans: &PlansConfig) -> Self {
        plans
            .assignments
            .iter()
            .fold(Self::new(plans.default_plan.clone()), |dir, (user, plan)| {
                dir.assign(user.as_str(), plan.clone())
            })
    }
}

#[async_trait]
impl PlanDirectory for StaticPlanDirectory {
    async fn plan_tier(&self, identity: &Identity) -> SubscriptionTier {
        let plan = self.assignments.get(&identity.user_id).unwrap_or(&self.default_plan).clone();
        if plan == self.default_plan {
            SubscriptionTier::Free { plan }
        } else {
            SubscriptionTier::Paid { plan }
        }
    }
}
