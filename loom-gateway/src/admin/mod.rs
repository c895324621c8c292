//! Admin API used by the host application's tooling and the deploy
//! pipeline.
//!
//! Protected by `Authorization: Bearer <admin.api_key>` when a key is
//! configured.

mod handlers;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};

use crate::engine::SharedEngine;
use crate::error::AdminError;

pub use handlers::{InstallResponse, ListQuery, LogsQuery};

/// Routes mounted under `/admin`.
pub fn router(engine: SharedEngine) -> Router<SharedEngine> {
    Router::new()
        .route("/routes", get(handlers::list_routes).post(handlers::create_route))
        .route(
            "/routes/{id}",
            get(handlers::get_route).patch(handlers::update_route).delete(handlers::delete_route),
        )
        .route("/routes/{id}/dependencies", post(handlers::install_dependencies))
        .route("/routes/{id}/logs", get(handlers::list_logs))
        .route("/deploy", post(handlers::deploy))
        .route_layer(middleware::from_fn_with_state(engine, require_api_key))
}

async fn require_api_key(
    State(engine): State<SharedEngine>,
    request: Request,
    next: Next,
) -> Result<Response, AdminError> {
    if let Some(expected) = engine.config.admin.api_key.as_deref() {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected) {
            return Err(AdminError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}
