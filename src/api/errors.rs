//! Maps [`crate::error::Error`] to HTTP status codes (spec.md §7).
//!
//! Interactive paths (everything reachable from this module) return the
//! error to the caller; background paths (event handlers, debounce timers,
//! shutdown cleanup) log and continue instead, and never flow through here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{ConflictError, Error, NotFoundError};

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::Conflict(ConflictError::CapacityExceeded(n)) => (
                StatusCode::CONFLICT,
                format!("fleet is at capacity ({n} instances)"),
            ),
            Error::Conflict(err) => (StatusCode::CONFLICT, err.to_string()),
            Error::NotFound(NotFoundError::Instance(_)) => {
                (StatusCode::NOT_FOUND, "instance not found".to_string())
            }
            Error::NotFound(NotFoundError::Session(_)) => {
                (StatusCode::NOT_FOUND, "session not found".to_string())
            }
            Error::Store(err) => {
                tracing::error!(error = %err, "store error on interactive path");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal store error".to_string(),
                )
            }
            Error::CapacityExhausted => (
                StatusCode::CONFLICT,
                "instance exceeded its reconnection retry cap".to_string(),
            ),
            other => {
                tracing::error!(error = %other, "unexpected error on interactive path");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
