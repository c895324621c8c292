//! Core types for the Loom dynamic route execution engine.
//!
//! Defines the domain model shared by every crate in the workspace: routes
//! and their access policy, usage records for rate limiting, execution log
//! entries, and the [`RouteStore`] persistence port.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod clock;
pub mod error;
pub mod id;
pub mod identity;
pub mod log;
pub mod route;
pub mod slug;
pub mod store;
pub mod usage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, StoreError};
pub use id::{ExecutionId, RouteId, UserId};
pub use identity::{Identity, SubscriptionTier};
pub use log::{
    ConsoleEntry, ConsoleLevel, ExecutionLogEntry, ExecutionOutcome, LogPage, RequestSnapshot,
};
pub use route::{
    DependencySpec, HttpMethod, PlanAccessTier, Route, RouteKind, RoutePatch, RouteSpec,
    RouteStatus,
};
pub use slug::Slug;
pub use store::RouteStore;
pub use usage::{rate_limit_window, CallerKey, UsageRecord};
