//! Structured errors for the edge adapter.
//!
//! Every error renders as JSON `{"error": CODE, "message": ...}` where
//! `CODE` is the upper-case prefix of the display string.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tilawa_core::Error;

#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    /// Failure on the proxied fetch path.
    #[error("{0}")]
    Upstream(Error),

    /// Failure in a control endpoint.
    #[error("{0}")]
    Core(#[from] Error),

    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    #[error("NOT_FOUND: {0}")]
    NotFound(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl EdgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EdgeError::Upstream(Error::Offline(_) | Error::Network(_)) => StatusCode::GATEWAY_TIMEOUT,
            EdgeError::Upstream(_) => StatusCode::BAD_GATEWAY,
            EdgeError::Core(Error::InvalidInput(_) | Error::InvalidUrl(_)) => StatusCode::BAD_REQUEST,
            EdgeError::Core(Error::Offline(_) | Error::Network(_)) => StatusCode::GATEWAY_TIMEOUT,
            EdgeError::Core(Error::HttpStatus(_)) => StatusCode::BAD_GATEWAY,
            EdgeError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EdgeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EdgeError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for EdgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        let error = message
            .split_once(':')
            .map_or("INTERNAL", |(code, _)| code)
            .to_string();

        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %message, "request failed");
        }

        (status, Json(ErrorBody { error, message })).into_response()
    }
}
