//! Axum router wiring.

use axum::{
    response::IntoResponse,
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::admin;
use crate::dispatch::{dispatch_custom, dispatch_logic};
use crate::engine::SharedEngine;

/// Build the gateway router with all routes and middleware attached.
pub fn create_router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/custom/{slug}", any(dispatch_custom))
        .route("/api/logic/{slug}", any(dispatch_logic))
        .nest("/admin", admin::router(SharedEngine::clone(&engine)))
        .with_state(engine)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// `GET /health`: liveness check.
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}
