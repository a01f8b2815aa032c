//! Per-backend validation records served by `/status`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of the most recent validation pass for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStatus {
    /// Backend name.
    pub backend: String,
    /// Whether the last ping succeeded.
    pub reachable: bool,
    /// Whether the backend's negotiated protocol version is accepted.
    pub protocol_valid: bool,
    /// Whether the backend declared the tools capability on initialize.
    pub has_tools_capability: bool,
    /// Number of tools currently published for this backend.
    pub tool_count: usize,
    /// Last error observed, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the backend was last validated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

impl ValidationStatus {
    /// Initial record for a backend that has not been validated yet.
    pub fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            reachable: false,
            protocol_valid: false,
            has_tools_capability: false,
            tool_count: 0,
            last_error: None,
            checked_at: None,
        }
    }

    /// Record for a backend excluded by a configuration conflict; it has
    /// no manager, so the record carries the reason instead.
    pub fn config_error(backend: &str, reason: &str) -> Self {
        Self { last_error: Some(reason.to_string()), ..Self::new(backend) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_camel_case() {
        let mut status = ValidationStatus::new("weather");
        status.reachable = true;
        status.tool_count = 3;
        status.checked_at = Some(Utc::now());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["backend"], "weather");
        assert_eq!(json["reachable"], true);
        assert_eq!(json["toolCount"], 3);
        assert_eq!(json["protocolValid"], false);
        assert!(json.get("lastError").is_none());
        assert!(json.get("checkedAt").is_some());
    }

    #[test]
    fn test_config_error_record() {
        let status = ValidationStatus::config_error("shadow", "duplicate empty tool prefix");
        assert!(!status.reachable);
        assert_eq!(status.last_error.as_deref(), Some("duplicate empty tool prefix"));
        assert!(status.checked_at.is_none());
    }
}
