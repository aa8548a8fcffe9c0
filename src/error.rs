use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Unified error type for API responses.
#[derive(Debug)]
pub enum ApiError {
    Db(String),
    Upstream(String),
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    TooManySymbols(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(msg) => write!(f, "db_error: {msg}"),
            Self::Upstream(msg) => write!(f, "upstream_error: {msg}"),
            Self::NotFound(msg) => write!(f, "not_found: {msg}"),
            Self::BadRequest(msg) => write!(f, "bad_request: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::TooManySymbols(msg) => write!(f, "too_many_symbols: {msg}"),
            Self::Internal(msg) => write!(f, "internal_error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match &self {
            Self::Db(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "db_error", msg.clone()),
            Self::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg.clone()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.clone()),
            Self::TooManySymbols(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "too_many_symbols", msg.clone())
            }
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
        };

        let body = json!({ "error": error, "detail": detail });
        (status, axum::Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(e.to_string())
    }
}

impl From<r2d2::Error> for ApiError {
    fn from(e: r2d2::Error) -> Self {
        Self::Db(e.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Upstream(e.to_string())
    }
}
