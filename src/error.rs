use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Poll error: {0}")]
    Poll(#[from] PollError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Errors produced inside a poll cycle.
///
/// `ConfigMissing`, `Tunnel`, `Connect` and `Query` abort the cycle without
/// advancing the checkpoint. `Transaction` is per-transaction only: it is
/// logged, collected into the cycle report, and the rest of the batch keeps
/// going.
#[derive(Error, Debug)]
pub enum PollError {
    #[error("No active Lamassu configuration")]
    ConfigMissing,

    #[error("Tunnel failure: {0}")]
    Tunnel(String),

    #[error("Ledger connection failure: {0}")]
    Connect(String),

    #[error("Ledger query failure: {0}")]
    Query(String),

    #[error("Failed processing transaction {external_id}: {reason}")]
    Transaction { external_id: String, reason: String },
}

impl PollError {
    /// Whether this error aborts the whole cycle, as opposed to being
    /// isolated to a single ledger transaction.
    pub fn is_fatal_for_cycle(&self) -> bool {
        !matches!(self, PollError::Transaction { .. })
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Poll(PollError::ConfigMissing) => (
                StatusCode::CONFLICT,
                "NO_ACTIVE_CONFIG",
                "No active Lamassu configuration".to_string(),
                None,
            ),
            AppError::Poll(PollError::Tunnel(detail)) => (
                StatusCode::BAD_GATEWAY,
                "TUNNEL_FAILURE",
                format!("SSH tunnel failure: {}", detail),
                Some(serde_json::json!({"stage": "tunnel"})),
            ),
            AppError::Poll(PollError::Connect(detail)) => (
                StatusCode::BAD_GATEWAY,
                "LEDGER_CONNECT_FAILURE",
                format!("Ledger connection failure: {}", detail),
                Some(serde_json::json!({"stage": "connect"})),
            ),
            AppError::Poll(PollError::Query(detail)) => (
                StatusCode::BAD_GATEWAY,
                "LEDGER_QUERY_FAILURE",
                format!("Ledger query failure: {}", detail),
                Some(serde_json::json!({"stage": "query"})),
            ),
            AppError::Poll(PollError::Transaction { external_id, reason }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "TRANSACTION_FAILURE",
                format!("Failed processing transaction {}: {}", external_id, reason),
                Some(serde_json::json!({"external_id": external_id})),
            ),
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, "NOT_FOUND", what, None),
            AppError::InvalidInput(detail) => {
                (StatusCode::BAD_REQUEST, "INVALID_INPUT", detail, None)
            }
            AppError::Conflict(detail) => (StatusCode::CONFLICT, "CONFLICT", detail, None),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
