//! Unified application error types and conversion helpers.
//! These errors are intended for internal use; WebSocket peers only ever see the
//! `error` outbound event, REST callers see [`ErrorResponse`].

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// High-level classification for mapping to client error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed JSON / invalid schema
    Parse,
    /// A control command targeted a device role nobody currently holds
    NotConnected,
    /// Frame came from a device id the endpoint does not accept
    InvalidDevice,
    /// Unexpected internal error / bug
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            serde_json::to_string(self).unwrap_or_else(|_| "internal".into())
        )
    }
}

/// Core error enum used throughout the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("parse error: {0}")]
    Parse(String),
    /// The `Display` text is what observers receive in the `error` event.
    #[error("{0} not connected")]
    NotConnected(String),
    #[error("{0}")]
    InvalidDevice(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Parse(_) => ErrorKind::Parse,
            AppError::NotConnected(_) => ErrorKind::NotConnected,
            AppError::InvalidDevice(_) => ErrorKind::InvalidDevice,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Short machine error code string (snake_case) used in REST error bodies.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Parse => "parse_error",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::InvalidDevice => "invalid_device",
            ErrorKind::Internal => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Parse | ErrorKind::InvalidDevice => StatusCode::BAD_REQUEST,
            ErrorKind::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Shorthand constructors for common errors.
pub mod err {
    use super::AppError;
    pub fn parse(msg: impl Into<String>) -> AppError {
        AppError::Parse(msg.into())
    }
    pub fn not_connected(target: impl Into<String>) -> AppError {
        AppError::NotConnected(target.into())
    }
    pub fn invalid_device(msg: impl Into<String>) -> AppError {
        AppError::InvalidDevice(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> AppError {
        AppError::Internal(msg.into())
    }
}

/// Simple JSON error response for REST endpoints (distinct from the WS `error` event)
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,   // machine code
    pub message: String, // human readable
}

impl From<&AppError> for ErrorResponse {
    fn from(e: &AppError) -> Self {
        Self {
            error: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorResponse::from(&self))).into_response()
    }
}
