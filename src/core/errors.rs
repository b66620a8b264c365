use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Error taxonomy shared by all request handlers.
///
/// `LimitExceeded` is an expected outcome and carries the values the client
/// needs to render an upgrade prompt; it is never logged as an error.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("usage limit exceeded")]
    LimitExceeded { remaining: i64, limit: i64 },

    #[error("invalid webhook signature")]
    SignatureInvalid,

    #[error("workflow dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<diesel::result::Error> for ApiError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => Self::NotFound,
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<diesel::r2d2::PoolError> for ApiError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            // Uniform message: must not leak whether an account exists.
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "Unauthorized" }),
            ),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": "Not found" }),
            ),
            Self::LimitExceeded { remaining, limit } => (
                StatusCode::TOO_MANY_REQUESTS,
                serde_json::json!({
                    "error": "Usage limit exceeded",
                    "remaining": remaining,
                    "limit": limit,
                }),
            ),
            Self::SignatureInvalid => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": "Webhook signature verification failed" }),
            ),
            Self::DispatchFailed(name) => (
                StatusCode::BAD_GATEWAY,
                serde_json::json!({ "error": format!("Workflow trigger failed: {name}") }),
            ),
            Self::Unavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": "Service temporarily unavailable" }),
            ),
            Self::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "Internal server error" }),
            ),
            Self::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": msg }),
            ),
        };

        match &self {
            Self::LimitExceeded { .. } | Self::Unauthorized | Self::NotFound => {}
            Self::SignatureInvalid | Self::BadRequest(_) => {
                tracing::warn!("request rejected: {self}");
            }
            other => tracing::error!("request failed: {other}"),
        }

        (status, Json(body)).into_response()
    }
}
