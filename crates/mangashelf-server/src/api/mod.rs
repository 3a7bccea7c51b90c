pub mod downloads;
pub mod health;
pub mod library;

use axum::{http::StatusCode, Json};
use mangashelf_download::DownloadError;
use serde_json::{json, Value};

/// Handler error: a status code and a `{"error": ...}` body.
pub type ApiError = (StatusCode, Json<Value>);

pub fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Map a pipeline error onto an HTTP status: validation → 400, missing
/// download → 404, everything else → 500.
pub fn download_error(e: DownloadError) -> ApiError {
    let status = match &e {
        DownloadError::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {e}");
    }
    error_response(status, e.to_string())
}
