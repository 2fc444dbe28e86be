use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use shutterflow_core::error::PipelineError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound(msg) => Self::not_found(msg),
            PipelineError::Config(msg) => Self::bad_request(msg),
            PipelineError::InvalidState(msg) => Self::conflict(msg),
            // Replication failures are upstream problems, not ours.
            PipelineError::Replication(err) => Self::bad_gateway(err.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shutterflow_core::syncthing::ReplicationError;

    #[test]
    fn pipeline_errors_map_to_http_statuses() {
        let cases = [
            (
                PipelineError::NotFound("batch 7".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                PipelineError::Config("bad pattern".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                PipelineError::InvalidState("already syncing".into()),
                StatusCode::CONFLICT,
            ),
            (
                PipelineError::Replication(ReplicationError::Auth { status: 403 }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                PipelineError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(AppError::from(error).status, expected);
        }
    }

    #[test]
    fn auth_failures_keep_their_remediation_hint() {
        let error = AppError::from(PipelineError::Replication(ReplicationError::Auth {
            status: 401,
        }));
        assert!(error.message.contains("Verify Syncthing API key"));
    }
}
