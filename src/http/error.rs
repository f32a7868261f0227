use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::store::StoreError;

/// API-facing error with an HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 400: the request is malformed.
    #[error("{0}")]
    BadRequest(String),
    /// 401: missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,
    /// 404: the resource is missing or owned by someone else.
    #[error("not found")]
    NotFound,
    /// 409: the request conflicts with in-flight work.
    #[error("{0}")]
    Conflict(String),
    /// 429: a rate limit fired.
    #[error("rate limit exceeded")]
    TooManyRequests,
    /// 500: something unexpected; details stay in the logs.
    #[error("internal server error")]
    Internal(#[source] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::Conflict(message) => Self::Conflict(message),
            StoreError::Validation(message) => Self::BadRequest(message),
            StoreError::Schedule(err) => Self::BadRequest(err.to_string()),
            other => Self::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(source) => {
                error!(%source, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
