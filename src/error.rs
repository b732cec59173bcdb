use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::compile::{
    models::{CompileFailure, ErrorKind},
    queue::SubmitError,
};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Method Not Allowed")]
    MethodNotAllowed,
    #[error("queue is full")]
    QueueFull,
    #[error("{0}")]
    Unavailable(String),
    #[error("{}", .0.message)]
    Compile(CompileFailure),
    #[error("backend is not ready")]
    BackendNotReady,
    #[error("backend request failed: {0}")]
    Backend(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::QueueFull | Self::Unavailable(_) | Self::BackendNotReady => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Compile(failure) => match failure.kind {
                ErrorKind::EmptyInput | ErrorKind::SourceTooLarge => StatusCode::BAD_REQUEST,
                ErrorKind::CompileError => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::ConfigurationError => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(value: SubmitError) -> Self {
        match value {
            SubmitError::QueueFull => Self::QueueFull,
            SubmitError::Closed => Self::Internal(value.to_string()),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_failures_map_to_client_or_server_status() {
        let status = |kind| ApiError::Compile(CompileFailure::new(kind, "x")).status();
        assert_eq!(status(ErrorKind::EmptyInput), StatusCode::BAD_REQUEST);
        assert_eq!(status(ErrorKind::CompileError), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(ErrorKind::ConfigurationError), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(ErrorKind::ArtifactMissing), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn compile_failure_displays_raw_message() {
        let err = ApiError::Compile(CompileFailure::new(
            ErrorKind::CompileError,
            "error: expected ';'",
        ));
        assert_eq!(err.to_string(), "error: expected ';'");
    }
}
