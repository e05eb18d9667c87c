use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use market_data::EngineError;
use serde_json::json;
use thiserror::Error;
use types::prelude::ValidationError;

/// Central error type for the control API
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Upstream exchange error: {0}")]
    BadGateway(String),

    #[error("Internal server error")]
    InternalError(#[from] anyhow::Error),
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownExchange(_) => AppError::NotFound(err.to_string()),
            EngineError::NotStarted => AppError::ServiceUnavailable(err.to_string()),
            EngineError::AlreadyStarted => AppError::Conflict(err.to_string()),
            EngineError::Reconcile(e) => AppError::ServiceUnavailable(e.to_string()),
            EngineError::Fetch(e) => AppError::BadGateway(e.to_string()),
            EngineError::Store(e) => AppError::ServiceUnavailable(e.to_string()),
            EngineError::Watermark(e) => AppError::InternalError(e.into()),
            EngineError::Config(e) => AppError::InternalError(e.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, code) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "NOT_FOUND"),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg, "CONFLICT"),
            AppError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                msg,
                "SERVICE_UNAVAILABLE",
            ),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg, "UPSTREAM_ERROR"),
            AppError::InternalError(e) => {
                tracing::error!(error = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_ERROR",
                )
            }
        };

        let body = Json(json!({
            "error": code,
            "message": error_message
        }));

        (status, body).into_response()
    }
}
