//! HTTP gateway for the Loom route execution engine.
//!
//! Dispatches `/api/custom/{slug}` and `/api/logic/{slug}` through the
//! access gate, rate limiter, sandbox, and execution logger, and exposes the
//! admin API the host application uses to manage routes.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod access;
pub mod admin;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod identity;
pub mod logger;
pub mod ratelimit;
pub mod registry;
pub mod routes;

pub use config::LoomConfig;
pub use engine::{Engine, EngineParts, SharedEngine};
pub use error::{AdminError, DispatchError, RegistryError};
pub use routes::create_router;
