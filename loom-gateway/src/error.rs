//! Error types for the gateway crate.
//!
//! Every error renders as the JSON envelope `{error, message, ...extra}`.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use loom_core::{CoreError, HttpMethod, PlanAccessTier, RouteId, RouteKind, StoreError};
use loom_executor::{ExecutionError, ProvisionError};
use serde_json::{json, Map, Value};

/// Builds the error envelope with optional extra fields.
fn envelope(status: StatusCode, kind: &str, message: &str, extra: Map<String, Value>) -> Response {
    let mut body = Map::new();
    body.insert("error".to_owned(), Value::from(kind));
    body.insert("message".to_owned(), Value::from(message));
    body.extend(extra);
    (status, Json(Value::Object(body))).into_response()
}

fn extra(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Why a dispatched request did not produce the handler's own response.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// No active route is registered under the slug.
    #[error("no active {kind} route '{slug}'")]
    RouteNotFound { kind: RouteKind, slug: String },

    #[error("route '{slug}' accepts {expected}, not {actual}")]
    MethodMismatch { slug: String, expected: HttpMethod, actual: String },

    #[error("this route requires an authenticated session")]
    Unauthenticated,

    #[error("this route requires a paid plan; current plan is '{plan}'")]
    PlanTierInsufficient { required: PlanAccessTier, plan: String, upgrade_url: String },

    #[error("daily limit of {limit} invocations reached")]
    RateLimitExceeded { limit: u32, used: u64, retry_after_secs: u64 },

    /// The handler ran and failed. Already logged by the time this exists.
    #[error("{error}")]
    Execution { error: ExecutionError, expose_stack: bool },

    /// The store failed before the handler ran. Details go to the operator
    /// channel only.
    #[error("persistence failure")]
    Persistence(String),

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

impl DispatchError {
    /// The envelope's `error` field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } => "RouteNotFound",
            Self::MethodMismatch { .. } => "MethodMismatch",
            Self::Unauthenticated => "Unauthenticated",
            Self::PlanTierInsufficient { .. } => "PlanTierInsufficient",
            Self::RateLimitExceeded { .. } => "RateLimitExceeded",
            Self::Execution { error: ExecutionError::DependencyMissing { .. }, .. } => {
                "DependencyMissing"
            }
            Self::Execution { error: ExecutionError::Timeout { .. }, .. } => "ExecutionTimeout",
            Self::Execution { .. } => "RuntimeError",
            Self::Persistence(_) => "InternalError",
            Self::BodyTooLarge { .. } => "PayloadTooLarge",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::MethodMismatch { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::PlanTierInsufficient { .. } => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Execution { .. } | Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = self.to_string();
        match self {
            Self::MethodMismatch { expected, .. } => {
                let mut resp = envelope(status, kind, &message, Map::new());
                resp.headers_mut()
                    .insert(header::ALLOW, HeaderValue::from_static(expected.as_str()));
                resp
            }
            Self::Unauthenticated => {
                let mut resp = envelope(status, kind, &message, Map::new());
                resp.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(r#"Bearer realm="loom""#),
                );
                resp
            }
            Self::PlanTierInsufficient { required, upgrade_url, .. } => envelope(
                status,
                kind,
                &message,
                extra(json!({"requiredTier": required.as_str(), "upgradeUrl": upgrade_url})),
            ),
            Self::RateLimitExceeded { limit, used, retry_after_secs } => {
                let mut resp =
                    envelope(status, kind, &message, extra(json!({"limit": limit, "used": used})));
                resp.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                resp
            }
            Self::Execution { error, expose_stack } => {
                let stack = error.stack().filter(|_| expose_stack);
                match stack {
                    Some(stack) => envelope(status, kind, &message, extra(json!({"stack": stack}))),
                    None => envelope(status, kind, &message, Map::new()),
                }
            }
            Self::RouteNotFound { .. } | Self::Persistence(_) | Self::BodyTooLarge { .. } => {
                envelope(status, kind, &message, Map::new())
            }
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Errors raised by the route registry.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error("route not found: {0}")]
    NotFound(RouteId),

    #[error("slug '{slug}' is already taken by another {kind} route")]
    SlugTaken { kind: RouteKind, slug: String },

    /// Activation was refused because the source does not compile.
    #[error("route source does not compile: {message}")]
    InvalidSource { message: String },

    #[error("dependency provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::SlugTaken { kind, slug } => Self::SlugTaken { kind, slug },
            StoreError::Backend(msg) => Self::Persistence(msg),
        }
    }
}

// ── Admin ─────────────────────────────────────────────────────────────────────

/// Errors returned by the admin API.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AdminError {
    #[error("missing or invalid admin api key")]
    Unauthorized,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<CoreError> for AdminError {
    fn from(err: CoreError) -> Self {
        Self::Registry(RegistryError::Validation(err))
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
            Self::Registry(RegistryError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "ValidationError")
            }
            Self::Registry(RegistryError::NotFound(_)) => (StatusCode::NOT_FOUND, "RouteNotFound"),
            Self::Registry(RegistryError::SlugTaken { .. }) => (StatusCode::CONFLICT, "SlugTaken"),
            Self::Registry(RegistryError::InvalidSource { .. }) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "InvalidSource")
            }
            Self::Registry(RegistryError::Provision(_)) => {
                (StatusCode::BAD_GATEWAY, "ProvisioningFailed")
            }
            Self::Registry(RegistryError::Persistence(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PersistenceError")
            }
        };
        if let Self::Registry(RegistryError::Persistence(detail)) = &self {
            tracing::error!(target: "loom::operator", error = %detail, "admin request hit a persistence failure");
            return envelope(status, kind, "persistence failure", Map::new());
        }
        envelope(status, kind, &self.to_string(), Map::new())
    }
}
