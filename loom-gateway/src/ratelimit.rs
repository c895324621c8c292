//! Sliding 24-hour invocation limits per (route, caller).
//!
//! The count-then-insert sequence is not atomic: concurrent requests from
//! one caller may overshoot the limit slightly, but once the window holds
//! `limit` records every later request is rejected.

use std::sync::Arc;
use std::time::Duration;

use loom_core::{rate_limit_window, CallerKey, Clock, Route, RouteStore, StoreError, UsageRecord};
use tokio::task::JoinHandle;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Admitted; a usage record was written if the route is limited.
    Allowed,
    Exceeded { limit: u32, used: u64, retry_after_secs: u64 },
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RouteStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn RouteStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Counts the caller's records in the trailing window and, if under the
    /// route's daily limit, records this invocation.
    ///
    /// Routes without a limit are always allowed and record nothing.
    ///
    /// # Errors
    /// Returns the underlying [`StoreError`] if the count or insert fails.
    pub async fn check_and_record(
        &self,
        route: &Route,
        caller: &CallerKey,
    ) -> Result<RateDecision, StoreError> {
        let Some(limit) = route.rate_limit_per_day else {
            return Ok(RateDecision::Allowed);
        };
        let now = self.clock.now();
        let since = now - rate_limit_window();
        let used = self.store.count_usage_since(route.id, caller, since).await?;
        if used >= u64::from(limit) {
            let oldest = self.store.oldest_usage_since(route.id, caller, since).await?;
            let retry_after_secs = oldest
                .map(|ts| (ts + rate_limit_window() - now).num_seconds())
                .and_then(|secs| u64::try_from(secs).ok())
                .unwrap_or(0)
                .max(1);
            tracing::debug!(route_id = %route.id, %caller, limit, used, "rate limit exceeded");
            return Ok(RateDecision::Exceeded { limit, used, retry_after_secs });
        }
        self.store.insert_usage(&UsageRecord::new(route.id, caller.clone(), now)).await?;
        Ok(RateDecision::Allowed)
    }

    /// Deletes usage records that have left the window.
    ///
    /// # Errors
    /// Returns the underlying [`StoreError`].
    pub async fn prune(&self) -> Result<u64, StoreError> {
        self.store.prune_usage(self.clock.now() - rate_limit_window()).await
    }

    /// Runs [`RateLimiter::prune`] every `every` until the task is aborted.
    pub fn spawn_pruner(&self, every: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match limiter.prune().await {
                    Ok(0) => {}
                    Ok(pruned) => tracing::info!(pruned, "pruned expired usage records"),
                    Err(e) => {
                        tracing::error!(target: "loom::operator", error = %e, "usage pruning failed");
                    }
                }
            }
        })
    }
}
