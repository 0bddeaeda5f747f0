//! Error taxonomy for the orchestration core.
//!
//! HTTP-facing failures are expressed as a closed `thiserror` enum so
//! handlers can match on *kind* rather than stringly-typed messages, and so
//! the mapping to status codes lives in exactly one place (`IntoResponse`
//! below) instead of being repeated at every call site.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Capacity(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    status: &'a str,
    error: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Capacity(_) => StatusCode::PAYLOAD_TOO_LARGE,
        };
        let body = ErrorBody {
            kind: "error",
            status: "error",
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
