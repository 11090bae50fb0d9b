//! HTTP surface of the sync server.
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `GET /api/me`: Returns current user info
//! - `POST /api/sync`: Submit a batch of offline operations
//! - `GET /api/sync/status`: Last checkpoint and pending change count
//! - `POST /api/sync/resolve`: Settle previously reported conflicts
//! - `GET /api/sync/changes`: Documents written since a watermark
//!
//! Everything under `/api` requires `Authorization: Bearer <api key>`.

pub mod auth;
pub mod error;
pub mod handlers;

pub use error::ApiError;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::identity::ApiKeyStore;
use crate::sync::SyncService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub api_keys: Arc<ApiKeyStore>,
    pub sync: Arc<SyncService>,
}

impl AppState {
    pub fn new(api_keys: ApiKeyStore, sync: SyncService) -> Self {
        Self {
            api_keys: Arc::new(api_keys),
            sync: Arc::new(sync),
        }
    }
}

/// Builds the router with public and authenticated routes.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(handlers::health));

    let protected_routes = Router::new()
        .route("/api/me", get(handlers::me))
        .route("/api/sync", post(handlers::sync))
        .route("/api/sync/status", get(handlers::status))
        .route("/api/sync/resolve", post(handlers::resolve))
        .route("/api/sync/changes", get(handlers::changes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
