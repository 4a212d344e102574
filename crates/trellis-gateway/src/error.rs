use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use trellis_core::error::{ErrorKind, TrellisError};

/// Error returned by API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Authenticated, but the key's role is too low for the route.
    Forbidden(&'static str),
    BadRequest(String),
    NotFound(String),
    Engine(TrellisError),
}

impl From<TrellisError> for ApiError {
    fn from(e: TrellisError) -> Self {
        Self::Engine(e)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Engine(TrellisError::TokenExpired) => (StatusCode::GONE, "expired"),
            Self::Engine(e) => match e.kind() {
                ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation"),
                ErrorKind::PermissionDenied => (StatusCode::FORBIDDEN, "permission_denied"),
                ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
                ErrorKind::Conflict => (StatusCode::CONFLICT, "conflict"),
                ErrorKind::StepFailure | ErrorKind::ExternalRejection => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "step_failure")
                }
                ErrorKind::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forbidden(needed) => write!(f, "{} access required", needed),
            Self::BadRequest(msg) => f.write_str(msg),
            Self::NotFound(what) => write!(f, "{} not found", what),
            Self::Engine(e) => write!(f, "{}", e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}
