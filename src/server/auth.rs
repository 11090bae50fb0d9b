//! Bearer API key authentication.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::error::ApiError;
use super::AppState;

/// Resolves the bearer key to an [`AuthUser`](crate::identity::AuthUser)
/// and stores it in the request extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) => match h.strip_prefix("Bearer ") {
            Some(key) => key.trim(),
            None => return ApiError::InvalidAuthScheme.into_response(),
        },
        None => return ApiError::MissingAuth.into_response(),
    };

    match state.api_keys.validate(api_key) {
        Some(user) => {
            tracing::debug!("Authenticated {} ({})", user.user_id, user.role);
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => ApiError::InvalidKey.into_response(),
    }
}
