//! Route handlers.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    Extension, Json,
};
use serde::Serialize;

use super::error::ApiError;
use super::AppState;
use crate::identity::{AuthUser, Role};
use crate::sync::{
    ChangeFeed, ChangeQuery, ResolutionReport, ResolveRequest, SyncOutcome, SyncRequest,
    SyncStatus,
};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint (no auth required)
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: crate::version(),
    })
}

/// Current user response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    user_id: String,
    role: Role,
}

pub async fn me(Extension(user): Extension<AuthUser>) -> Json<MeResponse> {
    Json(MeResponse {
        user_id: user.user_id,
        role: user.role,
    })
}

/// `POST /api/sync`
pub async fn sync(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    body: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SyncOutcome>, ApiError> {
    let Json(request) = body?;
    let outcome = state.sync.sync(&user, request).await?;
    Ok(Json(outcome))
}

/// `GET /api/sync/status`
pub async fn status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<SyncStatus>, ApiError> {
    Ok(Json(state.sync.status(&user).await?))
}

/// `POST /api/sync/resolve`
pub async fn resolve(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    body: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<ResolutionReport>, ApiError> {
    let Json(request) = body?;
    Ok(Json(state.sync.resolve_conflicts(&user, request).await?))
}

/// `GET /api/sync/changes`
pub async fn changes(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    query: Result<Query<ChangeQuery>, QueryRejection>,
) -> Result<Json<ChangeFeed>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::Validation(vec![e.body_text()]))?;
    tracing::debug!("Change feed requested by {}", user.user_id);
    Ok(Json(state.sync.changes(query).await?))
}
