use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Database(anyhow::Error),
    DatabaseError(String),
    NotFound(String),
    InvalidRequest(String),
    StaleVersion(String),
    MissingChunk(String),
    DeltaIntegrity(String),
    SessionTimeout(String),
    TargetOffline(String),
    Transport(String),
    ReadOnly(String),
    Internal(String),
    Configuration(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Database(err) => write!(f, "Database error: {}", err),
            AppError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            AppError::StaleVersion(msg) => write!(f, "Stale version: {}", msg),
            AppError::MissingChunk(msg) => write!(f, "Missing chunk: {}", msg),
            AppError::DeltaIntegrity(msg) => write!(f, "Delta integrity error: {}", msg),
            AppError::SessionTimeout(msg) => write!(f, "Session timeout: {}", msg),
            AppError::TargetOffline(msg) => write!(f, "Target offline: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::ReadOnly(msg) => write!(f, "Coordinator is read-only: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Database(err) => {
                tracing::error!("Database error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::StaleVersion(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::MissingChunk(msg) => (StatusCode::PRECONDITION_FAILED, msg.clone()),
            AppError::DeltaIntegrity(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::SessionTimeout(msg) => (StatusCode::REQUEST_TIMEOUT, msg.clone()),
            AppError::TargetOffline(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Transport(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::ReadOnly(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::Configuration(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.into())
    }
}

pub type AppResult<T> = Result<T, AppError>;
