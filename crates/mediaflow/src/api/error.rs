use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::db::DatabaseError;
use crate::recovery::RecoveryError;
use crate::transcription::GatewayError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    /// The job cannot be processed as it stands (422).
    #[error("{0}")]
    Unprocessable(String),

    /// A downstream service failed (502).
    #[error("{0}")]
    BadGateway(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Unprocessable(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "NOTHING_TO_PROCESS")
            }
            ApiError::BadGateway(_) => (StatusCode::BAD_GATEWAY, "DISPATCH_FAILED"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        log::error!("Database error: {}", e);
        ApiError::Internal(e.to_string())
    }
}

impl From<RecoveryError> for ApiError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::NotFound { job_id } => ApiError::NotFound(format!("job {}", job_id)),
            e @ RecoveryError::NothingToProcess { .. } => ApiError::Unprocessable(e.to_string()),
            e @ RecoveryError::DispatchFailed { .. } => ApiError::BadGateway(e.to_string()),
            RecoveryError::Database(e) => e.into(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::NotFound { job_id } => ApiError::NotFound(format!("job {}", job_id)),
            e @ GatewayError::Provider(_) => ApiError::BadGateway(e.to_string()),
            GatewayError::Database(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_error_mapping() {
        let not_found: ApiError = RecoveryError::NotFound {
            job_id: "j".to_string(),
        }
        .into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let nothing: ApiError = RecoveryError::NothingToProcess {
            job_id: "j".to_string(),
        }
        .into();
        assert_eq!(
            nothing.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        let dispatch: ApiError = RecoveryError::DispatchFailed {
            job_id: "j".to_string(),
            reason: "provider down".to_string(),
        }
        .into();
        assert_eq!(dispatch.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
