use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Validation failures the boundary itself raises before a handler ever
/// runs (missing/invalid tenant header, mostly). Anything past this point
/// is the handler's own business -- this type never wraps a 5xx.
#[derive(Debug)]
pub struct BoundaryError {
    status: StatusCode,
    message: String,
}

impl BoundaryError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl IntoResponse for BoundaryError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}
