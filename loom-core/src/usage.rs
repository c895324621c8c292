use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{RouteId, UserId};

/// Length of the trailing rate-limit window.
#[must_use]
pub fn rate_limit_window() -> Duration {
    Duration::hours(24)
}

/// The bucket a caller's invocations are counted in.
///
/// Authenticated users and anonymous network addresses never share a
/// bucket, even if a user id happens to look like an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CallerKey {
    User(UserId),
    Address(String),
}

impl CallerKey {
    /// Stable storage key: `user:<id>` or `ip:<addr>`.
    #[must_use]
    pub fn storage_key(&self) -> String {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::Address(addr) => format!("ip:{addr}"),
        }
    }
}

impl fmt::Display for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// One admitted invocation, counted against a route's daily limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub route_id: RouteId,
    pub caller: CallerKey,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    #[must_use]
    pub fn new(route_id: RouteId, caller: CallerKey, timestamp: DateTime<Utc>) -> Self {
        Self { route_id, caller, timestamp }
    }
}
