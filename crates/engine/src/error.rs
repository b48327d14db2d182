//! Error types for the flowmesh engine.
//!
//! `AppError` is returned by every store, gateway, evaluator and runner
//! operation and implements `IntoResponse` so handlers can bubble it
//! straight out to Axum.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level errors for the engine.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested status transition is not allowed from the current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue/broker error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed or non-evaluable expression
    #[error("Expression error: {0}")]
    Expression(String),

    /// A bracketed data-path reference could not be resolved
    #[error("Data path error: {0}")]
    DataPath(String),

    /// External service error (catalogs, function endpoints)
    #[error("External service error: {0}")]
    ExternalService(String),

    /// A result carried a status the state machine cannot act on
    #[error("Unexpected status: {0}")]
    UnexpectedStatus(String),
}

impl AppError {
    /// Whether this error stems from step configuration rather than
    /// from infrastructure. Configuration errors terminate a run and are
    /// never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AppError::Expression(_) | AppError::DataPath(_) | AppError::Config(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::Config(msg) => {
                tracing::error!(error = %msg, "Configuration error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::Queue(msg) => {
                tracing::error!(error = %msg, "Queue error");
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            AppError::Serialization(e) => {
                tracing::error!(error = %e, "Serialization error");
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AppError::Expression(msg) | AppError::DataPath(msg) => {
                tracing::warn!(error = %msg, "Expression evaluation failed");
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
            }
            AppError::ExternalService(msg) => {
                tracing::warn!(error = %msg, "External service error");
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
            AppError::UnexpectedStatus(msg) => {
                tracing::error!(error = %msg, "Unexpected status");
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalService(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = AppError::NotFound("Step instance not found".to_string());
        assert_eq!(err.to_string(), "Resource not found: Step instance not found");
    }

    #[test]
    fn test_configuration_errors() {
        assert!(AppError::Expression("bad".to_string()).is_configuration());
        assert!(AppError::DataPath("missing".to_string()).is_configuration());
        assert!(!AppError::Queue("down".to_string()).is_configuration());
    }

    #[test]
    fn test_unexpected_status_maps_to_unprocessable() {
        let response = AppError::UnexpectedStatus("RUNNING".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
