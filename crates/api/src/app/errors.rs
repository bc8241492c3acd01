use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use creditx_infra::{ErrorKind, ServiceError};

/// Map a service error onto the API's status codes.
pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err.kind() {
        ErrorKind::Validation => json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string()),
        ErrorKind::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        ErrorKind::HoldMismatch => json_error(StatusCode::BAD_REQUEST, "hold_mismatch", err.to_string()),
        ErrorKind::Conflict => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
        ErrorKind::Dependency { retryable: true } => {
            tracing::warn!(error = %err, "dependency unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "dependency_unavailable", err.to_string())
        }
        ErrorKind::Dependency { retryable: false } => {
            tracing::warn!(error = %err, "dependency error");
            json_error(StatusCode::BAD_GATEWAY, "dependency_error", err.to_string())
        }
        ErrorKind::Persistence => {
            tracing::error!(error = ?err, "request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
        }
    }
}

/// Error response for the write endpoints (create, cashback, commit).
///
/// An unknown account or transaction id in a command body or path is a bad
/// request: clients of these endpoints get `400 not_found`, and only the read
/// endpoints answer `404`. Every other kind maps as in
/// [`service_error_to_response`].
pub fn command_error_to_response(err: ServiceError) -> axum::response::Response {
    match err.kind() {
        ErrorKind::NotFound => json_error(StatusCode::BAD_REQUEST, "not_found", err.to_string()),
        _ => service_error_to_response(err),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
