use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use mailrelay_infra::jobs::{LeaseError, RepositoryError};

pub fn lease_error_to_response(err: LeaseError) -> axum::response::Response {
    match err {
        LeaseError::JobNotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}")),
        LeaseError::Conflict(id) => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("job {id} changed concurrently"),
        ),
        LeaseError::Repository(e) => repository_error_to_response(e),
    }
}

pub fn repository_error_to_response(err: RepositoryError) -> axum::response::Response {
    match err {
        RepositoryError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}")),
        RepositoryError::AlreadyExists(id) => json_error(
            StatusCode::CONFLICT,
            "already_exists",
            format!("job already exists: {id}"),
        ),
        RepositoryError::Unavailable(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg),
        e @ (RepositoryError::Storage(_) | RepositoryError::Corrupt(_)) => {
            tracing::error!(error = %e, "job store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
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
