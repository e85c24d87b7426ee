//! Error types for the session server

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Main error type for session and registry operations
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Unknown program: {0}")]
    UnknownProgram(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} has ended")]
    SessionClosed(String),

    #[error("Failed to spawn {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Viewer transport error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Upload rejected: {0}")]
    Upload(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ttyshare_proto::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::UnknownProgram(_) | RelayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::SessionClosed(_) => StatusCode::GONE,
            RelayError::Protocol(_)
            | RelayError::BadRequest(_)
            | RelayError::Upload(_)
            | RelayError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RelayError::UnknownProgram("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::SessionClosed("s".into()).status_code(),
            StatusCode::GONE
        );
        assert_eq!(
            RelayError::BadRequest("no command".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::Pty("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
