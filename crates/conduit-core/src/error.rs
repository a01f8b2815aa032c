//! Error types for gateway operations.

use std::io;
use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the gateway subsystems.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to reach or initialize a backend.
    #[error("backend '{backend}' connection error: {message}")]
    Connect { backend: String, message: String },

    /// A backend answered an outbound request with a non-success status.
    #[error("backend '{backend}' returned HTTP {status}")]
    UpstreamStatus { backend: String, status: u16 },

    /// Malformed or unexpected protocol payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No enabled backend serves the requested tool.
    #[error("no backend serves tool '{0}'")]
    Unroutable(String),

    /// Two backends declare prefixes of the same length matching the tool.
    #[error("tool '{0}' matches more than one backend prefix")]
    AmbiguousPrefix(String),

    /// The gateway session token failed validation.
    #[error("invalid gateway session: {0}")]
    SessionInvalid(String),

    /// The backend rejected a cached backend session (HTTP 404).
    #[error("backend '{backend}' no longer recognizes the session")]
    SessionGone { backend: String },

    /// A prefixed tool name is already registered by another backend.
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether the client may retry the request unchanged and expect it
    /// to succeed (after the gateway repaired its own state).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SessionGone { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_display_includes_backend() {
        let err = Error::Connect { backend: "weather".to_string(), message: "refused".to_string() };
        let display = err.to_string();
        assert!(display.contains("weather"));
        assert!(display.contains("refused"));
    }

    #[test]
    fn test_unroutable_display() {
        let err = Error::Unroutable("w_fetch".to_string());
        assert!(err.to_string().contains("w_fetch"));
    }

    #[test]
    fn test_session_gone_is_retryable() {
        let err = Error::SessionGone { backend: "calendar".to_string() };
        assert!(err.is_retryable());
        assert!(!Error::Unroutable("x".to_string()).is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_json_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
