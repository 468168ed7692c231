//! Error-to-status mapping at the API edge.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use conveyor_core::QueueError;

/// API-facing error: a status code plus human-readable detail, serialized
/// as `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let status = match &err {
            QueueError::Validation(_)
            | QueueError::CycleDetected
            | QueueError::UnknownDependency(_)
            | QueueError::StateConflict { .. } => StatusCode::BAD_REQUEST,
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::Internal(inner) => {
                tracing::error!(error = ?inner, "internal error at API edge");
                return Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    detail: "Internal server error".to_string(),
                };
            }
        };
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"detail": self.detail}))).into_response()
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::bad_request(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn queue_errors_map_to_documented_status_codes() {
        let cases = [
            (QueueError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (QueueError::CycleDetected, StatusCode::BAD_REQUEST),
            (
                QueueError::NotFound(Uuid::new_v4()),
                StatusCode::NOT_FOUND,
            ),
            (
                QueueError::TransientStore(anyhow::anyhow!("down")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                QueueError::Internal(anyhow::anyhow!("bug")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }

    #[test]
    fn internal_errors_never_leak_detail() {
        let err = ApiError::from(QueueError::Internal(anyhow::anyhow!("secret table missing")));
        assert_eq!(err.detail, "Internal server error");
    }
}
