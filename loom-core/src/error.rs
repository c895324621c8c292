use crate::id::RouteId;
use crate::route::RouteKind;

/// Validation errors produced by the `loom-core` crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The HTTP method is not one of GET/POST/PUT/DELETE/PATCH.
    #[error("unsupported http method '{0}'; expected one of GET, POST, PUT, DELETE, PATCH")]
    InvalidMethod(String),

    /// A slug normalized to the empty string.
    #[error("invalid slug '{raw}': must contain at least one of [a-z0-9]")]
    InvalidSlug { raw: String },

    /// A dependency specifier could not be parsed.
    #[error("invalid dependency '{raw}': {reason}")]
    InvalidDependency { raw: String, reason: String },

    /// A route field failed validation.
    #[error("route validation failed for field '{field}': {reason}")]
    Validation { field: String, reason: String },
}

/// Errors surfaced by a [`RouteStore`](crate::store::RouteStore) implementation.
///
/// These never reach an external caller verbatim; the gateway maps them to
/// an operator-facing log line or to an admin API error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No route with the given id exists.
    #[error("route not found: {0}")]
    NotFound(RouteId),

    /// Another route of the same kind already owns this slug.
    #[error("slug '{slug}' is already taken by another {kind} route")]
    SlugTaken { kind: RouteKind, slug: String },

    /// The backing store failed.
    #[error("persistence failure: {0}")]
    Backend(String),
}
