//! HTTP error mapping.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::sync::SyncError;

/// Every way a request can fail before or outside per-operation processing.
#[derive(Debug)]
pub enum ApiError {
    MissingAuth,
    InvalidAuthScheme,
    InvalidKey,
    /// Body or query failed validation; one entry per problem.
    Validation(Vec<String>),
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl ApiError {
    /// Status code, machine-readable code and human message.
    pub fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::MissingAuth => (
                StatusCode::UNAUTHORIZED,
                "missing_auth",
                "Authorization header required".to_string(),
            ),
            ApiError::InvalidAuthScheme => (
                StatusCode::UNAUTHORIZED,
                "invalid_auth",
                "Authorization header must use Bearer scheme".to_string(),
            ),
            ApiError::InvalidKey => (
                StatusCode::UNAUTHORIZED,
                "invalid_key",
                "Invalid API key".to_string(),
            ),
            ApiError::Validation(problems) => (
                StatusCode::BAD_REQUEST,
                "validation_failed",
                format!("Request failed validation ({} problem(s))", problems.len()),
            ),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error".to_string(),
            ),
        }
    }

    fn details(&self) -> Option<Vec<String>> {
        match self {
            ApiError::Validation(problems) => Some(problems.clone()),
            _ => None,
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Validation(problems) => ApiError::Validation(problems),
            SyncError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(vec![rejection.body_text()])
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!("Request failed: {}", detail);
        }

        let (status, error, message) = self.parts();
        let body = ErrorBody {
            error,
            message,
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}
