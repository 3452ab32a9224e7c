use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use itemd_kv::KVError;
use thiserror::Error;

// ── ServiceError ────────────────────────────────────────────────────

/// Error type returned by every HTTP handler.
///
/// Each variant maps to one HTTP status code. The JSON response body is
/// always a single field carrying the message:
///
/// ```json
/// {"error": "key 'abc' not found"}
/// ```
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Key does not exist. HTTP 404.
    #[error("{0}")]
    NotFound(String),

    /// Request shape is invalid (empty key, bad JSON, missing field). HTTP 400.
    #[error("{0}")]
    Validation(String),

    /// Storage engine failure. HTTP 500.
    #[error("{0}")]
    Storage(String),

    /// A value failed to encode to or decode from JSON. HTTP 500.
    #[error("{0}")]
    Encoding(String),

    /// Route exists but not for this method. HTTP 405.
    #[error("{0}")]
    MethodNotAllowed(String),

    /// Request cancelled because the server is shutting down. HTTP 503.
    #[error("{0}")]
    Unavailable(String),
}

impl ServiceError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<KVError> for ServiceError {
    fn from(e: KVError) -> Self {
        match e {
            KVError::NotFound(_) => ServiceError::NotFound(e.to_string()),
            other => ServiceError::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Encoding(e.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}
