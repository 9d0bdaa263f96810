//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<forgeline_core::Error> for ApiError {
    fn from(err: forgeline_core::Error) -> Self {
        use forgeline_core::Error;
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            Error::Conflict(msg) => ApiError::Conflict(msg),
            Error::InvalidTransition { from, to } => {
                ApiError::Conflict(format!("invalid state transition: {from} -> {to}"))
            }
            Error::RemoteDisabled => {
                ApiError::BadRequest("remote execution is disabled".to_string())
            }
            Error::Cancelled => ApiError::Conflict("run was cancelled".to_string()),
            Error::Timeout(msg) => ApiError::Internal(format!("timeout: {msg}")),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<forgeline_db::DbError> for ApiError {
    fn from(err: forgeline_db::DbError) -> Self {
        use forgeline_db::DbError;
        match err {
            DbError::NotFound(msg) => ApiError::NotFound(msg),
            DbError::Duplicate(msg) => ApiError::Conflict(msg),
            DbError::InvalidData(msg) => ApiError::BadRequest(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
