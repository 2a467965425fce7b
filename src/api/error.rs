//! API error types and conversions

use std::fmt::Display;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// API error types, rendered as plain text
#[derive(Debug)]
pub enum ApiError {
    /// Rejected admin request (bad config, nothing staged, ...)
    BadRequest(String),

    /// Dashboard query failed
    Internal(String),
}

impl ApiError {
    pub fn bad_request(err: impl Display) -> Self {
        ApiError::BadRequest(err.to_string())
    }

    pub fn internal(err: impl Display) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, message).into_response()
    }
}
