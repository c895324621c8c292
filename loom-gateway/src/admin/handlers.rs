use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use loom_core::{LogPage, Route, RouteId, RouteKind, RoutePatch, RouteSpec};
use loom_executor::InstallReport;
use serde::{Deserialize, Serialize};

use crate::engine::SharedEngine;
use crate::error::AdminError;
use crate::registry::DeployRequest;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub kind: Option<RouteKind>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Body of a successful dependency install.
#[derive(Debug, Serialize)]
pub struct InstallResponse {
    pub route: Route,
    pub report: InstallReport,
}

fn route_id(raw: &str) -> Result<RouteId, AdminError> {
    raw.parse().map_err(|_| AdminError::InvalidRequest(format!("'{raw}' is not a route id")))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AdminError> {
    body.map(|Json(v)| v).map_err(|e| AdminError::InvalidRequest(e.body_text()))
}

fn query<T>(q: Result<Query<T>, QueryRejection>) -> Result<T, AdminError> {
    q.map(|Query(v)| v).map_err(|e| AdminError::InvalidRequest(e.body_text()))
}

/// `GET /admin/routes?kind=`: list routes, oldest first.
///
/// # Errors
/// Returns [`AdminError::InvalidRequest`] for an unknown kind.
pub async fn list_routes(
    State(engine): State<SharedEngine>,
    q: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<Route>>, AdminError> {
    let ListQuery { kind } = query(q)?;
    Ok(Json(engine.registry.list(kind).await?))
}

/// `POST /admin/routes`: register a route.
///
/// # Errors
/// Returns validation, conflict, or source errors from the registry.
pub async fn create_route(
    State(engine): State<SharedEngine>,
    body: Result<Json<RouteSpec>, JsonRejection>,
) -> Result<impl IntoResponse, AdminError> {
    let route = engine.registry.register(json_body(body)?).await?;
    Ok((StatusCode::CREATED, Json(route)))
}

/// `GET /admin/routes/{id}`
///
/// # Errors
/// Returns a not-found error for unknown ids.
pub async fn get_route(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<Json<Route>, AdminError> {
    Ok(Json(engine.registry.get(route_id(&id)?).await?))
}

/// `PATCH /admin/routes/{id}`: partial update.
///
/// # Errors
/// Returns validation, conflict, source, or not-found errors.
pub async fn update_route(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    body: Result<Json<RoutePatch>, JsonRejection>,
) -> Result<Json<Route>, AdminError> {
    let id = route_id(&id)?;
    Ok(Json(engine.registry.update(id, json_body(body)?).await?))
}

/// `DELETE /admin/routes/{id}`: delete a route with its logs and usage.
///
/// # Errors
/// Returns a not-found error for unknown ids.
pub async fn delete_route(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    engine.registry.delete(route_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /admin/routes/{id}/dependencies`: provision declared packages.
///
/// # Errors
/// Returns a not-found error, or a provisioning error if the route's
/// module directory cannot be reset.
pub async fn install_dependencies(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<Json<InstallResponse>, AdminError> {
    let (route, report) = engine.registry.install_dependencies(route_id(&id)?).await?;
    Ok(Json(InstallResponse { route, report }))
}

/// `GET /admin/routes/{id}/logs?limit&offset`: newest first.
///
/// # Errors
/// Returns a not-found error for unknown ids.
pub async fn list_logs(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    q: Result<Query<LogsQuery>, QueryRejection>,
) -> Result<Json<LogPage>, AdminError> {
    let id = route_id(&id)?;
    let LogsQuery { limit, offset } = query(q)?;
    Ok(Json(engine.registry.list_logs(id, limit, offset).await?))
}

/// `POST /admin/deploy`: create or overwrite a route and activate it.
///
/// # Errors
/// Returns validation or source errors from the registry.
pub async fn deploy(
    State(engine): State<SharedEngine>,
    body: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<Json<Route>, AdminError> {
    Ok(Json(engine.registry.deploy(json_body(body)?).await?))
}
