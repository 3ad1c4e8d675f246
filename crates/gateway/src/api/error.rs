//! Maps `sa_domain::error::Error` onto HTTP responses.
//!
//! Builds a `{"error": "<message>"}` JSON body with a status code,
//! expressed as an `IntoResponse` impl since every handler in this crate
//! returns `Result<_, Error>` directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sa_domain::error::Error;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Stale(_) => StatusCode::CONFLICT,
            Error::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Cancelled(_) => StatusCode::GONE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Provider { .. } | Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Io(_) | Error::Json(_) | Error::Execution(_) | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        api_error(status, self.0.to_string())
    }
}

/// Newtype so the orphan rule lets us implement `IntoResponse` for the
/// shared domain error from this crate.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
