//! MCP protocol message types and JSON-RPC 2.0 handling.
//!
//! The gateway speaks MCP over streamable HTTP on both sides: as a server
//! to clients (broker) and as a client to backends (upstream). This module
//! holds the shared envelope types, the method dispatch enum, and the
//! mapping from gateway errors to JSON-RPC error objects.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Protocol version the gateway advertises on initialize.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions accepted from backends and clients.
pub const ACCEPTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

/// Method name a backend uses to announce a changed tool catalog.
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// HTTP headers owned by the gateway on the MCP listener.
pub mod headers {
    /// Session correlation header (gateway session on the public side,
    /// backend session after the router rewrites a routed call).
    pub const SESSION_ID: &str = "mcp-session-id";
    /// Marker the router sets on hair-pinned backend initialize requests
    /// so it recognizes its own traffic on re-entry.
    pub const INIT_HOST: &str = "mcp-init-host";
    /// Identity of the backend an outbound or routed request targets.
    pub const SERVER_ID: &str = "gateway-server-id";
    /// Signed allow-list token accepted on tools/list when a trusted
    /// header public key is configured.
    pub const ALLOWED_TOOLS: &str = "x-allowed-tools";
}

/// JSON-RPC 2.0 error codes used by the gateway.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server-defined code for failures the client should retry.
    pub const RETRYABLE: i32 = -32000;
}

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (should be "2.0").
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    /// Build a request with the given id.
    pub fn new(method: &str, params: Option<Value>, id: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), method: method.to_string(), params, id: Some(id) }
    }
}

/// JSON-RPC 2.0 response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (should be "2.0").
    pub jsonrpc: String,
    /// Result (on success).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Request ID (matches the request).
    pub id: Option<Value>,
}

impl JsonRpcResponse {
    /// Build a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), result: Some(result), error: None, id }
    }

    /// Build an error response.
    pub fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
        Self { jsonrpc: "2.0".to_string(), result: None, error: Some(error), id }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Optional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Build an error object with no data payload.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    /// Map a gateway error to the JSON-RPC error the client receives.
    pub fn from_gateway(err: &Error) -> Self {
        match err {
            Error::Protocol(m) => Self::new(error_codes::PARSE_ERROR, format!("Parse error: {m}")),
            Error::Json(e) => Self::new(error_codes::PARSE_ERROR, format!("Parse error: {e}")),
            Error::SessionInvalid(m) => {
                Self::new(error_codes::INVALID_REQUEST, format!("Invalid session: {m}"))
            }
            Error::Unroutable(name) | Error::AmbiguousPrefix(name) => {
                Self::new(error_codes::METHOD_NOT_FOUND, format!("Unknown tool: {name}"))
            }
            Error::SessionGone { backend } => Self {
                code: error_codes::RETRYABLE,
                message: format!("backend '{backend}' session expired, retry the request"),
                data: Some(json!({ "retryable": true, "backend": backend })),
            },
            Error::Connect { backend, message } => Self {
                code: error_codes::INTERNAL_ERROR,
                message: format!("backend '{backend}' unavailable: {message}"),
                data: Some(json!({ "backend": backend })),
            },
            other => Self::new(error_codes::INTERNAL_ERROR, other.to_string()),
        }
    }
}

/// JSON-RPC 2.0 notification message (no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (should be "2.0").
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Build a notification.
    pub fn new(method: &str) -> Self {
        Self { jsonrpc: "2.0".to_string(), method: method.to_string(), params: None }
    }
}

/// MCP protocol message (request, response, or notification).
#[derive(Debug, Clone)]
pub enum McpMessage {
    /// Request message.
    Request(JsonRpcRequest),
    /// Response message.
    Response(JsonRpcResponse),
    /// Notification message.
    Notification(JsonRpcNotification),
}

impl McpMessage {
    /// Parse a message from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a JSON-RPC 2.0 message.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::Protocol(format!("invalid JSON: {e}")))?;

        if value.get("method").is_some() {
            if value.get("id").is_some() {
                let request: JsonRpcRequest = serde_json::from_value(value)
                    .map_err(|e| Error::Protocol(format!("invalid request: {e}")))?;
                return Ok(McpMessage::Request(request));
            }
            let notification: JsonRpcNotification = serde_json::from_value(value)
                .map_err(|e| Error::Protocol(format!("invalid notification: {e}")))?;
            return Ok(McpMessage::Notification(notification));
        }

        if value.get("result").is_some() || value.get("error").is_some() {
            let response: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| Error::Protocol(format!("invalid response: {e}")))?;
            return Ok(McpMessage::Response(response));
        }

        Err(Error::Protocol("not a JSON-RPC message".to_string()))
    }
}

/// MCP methods the gateway dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpMethod {
    Initialize,
    Initialized,
    Ping,
    ToolsList,
    ToolsCall,
    /// Any other `notifications/*` method.
    Notification(String),
    /// Anything else; answered with method-not-found.
    Other(String),
}

impl McpMethod {
    /// Classify a wire method name.
    pub fn parse(method: &str) -> Self {
        match method {
            "initialize" => McpMethod::Initialize,
            "notifications/initialized" => McpMethod::Initialized,
            "ping" => McpMethod::Ping,
            "tools/list" => McpMethod::ToolsList,
            "tools/call" => McpMethod::ToolsCall,
            m if m.starts_with("notifications/") => McpMethod::Notification(m.to_string()),
            other => McpMethod::Other(other.to_string()),
        }
    }
}

/// MCP initialize request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version requested by the peer.
    pub protocol_version: String,
    /// Peer capabilities (opaque to the gateway).
    #[serde(default)]
    pub capabilities: Value,
    /// Peer implementation info.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Implementation>,
}

/// MCP initialize result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol version the server settled on.
    pub protocol_version: String,
    /// Server capabilities.
    pub capabilities: ServerCapabilities,
    /// Server implementation info.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
}

impl InitializeResult {
    /// Whether the negotiated protocol version is one the gateway accepts.
    pub fn protocol_accepted(&self) -> bool {
        ACCEPTED_PROTOCOL_VERSIONS.contains(&self.protocol_version.as_str())
    }

    /// Whether the server declared the tools capability.
    pub fn has_tools_capability(&self) -> bool {
        self.capabilities.tools.is_some()
    }
}

/// Server capabilities advertised on initialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    /// Tools capability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    /// Any other capability blocks, passed through untouched.
    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

/// Tools capability block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    /// Whether the server emits tools/list_changed notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Implementation name/version pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name.
    pub name: String,
    /// Implementation version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Tool definition as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tool input schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Result payload of tools/list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsListResult {
    /// Tools in this page.
    pub tools: Vec<ToolDescriptor>,
    /// Cursor for the next page, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_from_bytes_request() {
        let json = r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"x"},"id":1}"#;
        let message = McpMessage::from_bytes(json.as_bytes()).unwrap();
        match message {
            McpMessage::Request(req) => {
                assert_eq!(req.method, "tools/call");
                assert_eq!(req.id, Some(json!(1)));
            }
            _ => panic!("Expected request"),
        }
    }

    #[test]
    fn test_message_from_bytes_notification() {
        let json = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let message = McpMessage::from_bytes(json.as_bytes()).unwrap();
        match message {
            McpMessage::Notification(notif) => {
                assert_eq!(notif.method, "notifications/initialized");
            }
            _ => panic!("Expected notification"),
        }
    }

    #[test]
    fn test_message_from_bytes_response() {
        let json = r#"{"jsonrpc":"2.0","result":{"ok":true},"id":7}"#;
        let message = McpMessage::from_bytes(json.as_bytes()).unwrap();
        assert!(matches!(message, McpMessage::Response(_)));
    }

    #[test]
    fn test_message_from_bytes_invalid() {
        assert!(McpMessage::from_bytes(b"not json").is_err());
        assert!(McpMessage::from_bytes(br#"{"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn test_method_dispatch() {
        assert_eq!(McpMethod::parse("initialize"), McpMethod::Initialize);
        assert_eq!(McpMethod::parse("tools/list"), McpMethod::ToolsList);
        assert_eq!(McpMethod::parse("tools/call"), McpMethod::ToolsCall);
        assert_eq!(McpMethod::parse("ping"), McpMethod::Ping);
        assert_eq!(McpMethod::parse("notifications/initialized"), McpMethod::Initialized);
        assert_eq!(
            McpMethod::parse("notifications/resources/list_changed"),
            McpMethod::Notification("notifications/resources/list_changed".to_string())
        );
        assert_eq!(McpMethod::parse("prompts/get"), McpMethod::Other("prompts/get".to_string()));
    }

    #[test]
    fn test_initialize_result_wire_casing() {
        let result = InitializeResult {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: Some(true) }),
                other: serde_json::Map::new(),
            },
            server_info: Some(Implementation {
                name: "conduit".to_string(),
                version: Some("0.1.0".to_string()),
            }),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["protocolVersion"], LATEST_PROTOCOL_VERSION);
        assert_eq!(json["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(json["serverInfo"]["name"], "conduit");
    }

    #[test]
    fn test_initialize_result_validation() {
        let accepted: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": { "listChanged": true } }
        }))
        .unwrap();
        assert!(accepted.protocol_accepted());
        assert!(accepted.has_tools_capability());

        let rejected: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "1999-01-01",
            "capabilities": { "prompts": {} }
        }))
        .unwrap();
        assert!(!rejected.protocol_accepted());
        assert!(!rejected.has_tools_capability());
    }

    #[test]
    fn test_tools_list_result_pagination_field() {
        let page: ToolsListResult = serde_json::from_value(json!({
            "tools": [{ "name": "fetch", "inputSchema": { "type": "object" } }],
            "nextCursor": "abc"
        }))
        .unwrap();
        assert_eq!(page.tools.len(), 1);
        assert_eq!(page.tools[0].name, "fetch");
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
    }

    #[test]
    fn test_error_mapping_codes() {
        let parse = JsonRpcError::from_gateway(&Error::Protocol("bad".to_string()));
        assert_eq!(parse.code, error_codes::PARSE_ERROR);

        let session = JsonRpcError::from_gateway(&Error::SessionInvalid("expired".to_string()));
        assert_eq!(session.code, error_codes::INVALID_REQUEST);

        let unroutable = JsonRpcError::from_gateway(&Error::Unroutable("z_tool".to_string()));
        assert_eq!(unroutable.code, error_codes::METHOD_NOT_FOUND);

        let gone =
            JsonRpcError::from_gateway(&Error::SessionGone { backend: "weather".to_string() });
        assert_eq!(gone.code, error_codes::RETRYABLE);
        assert_eq!(gone.data.as_ref().unwrap()["retryable"], true);

        let connect = JsonRpcError::from_gateway(&Error::Connect {
            backend: "weather".to_string(),
            message: "refused".to_string(),
        });
        assert_eq!(connect.code, error_codes::INTERNAL_ERROR);
        assert_eq!(connect.data.as_ref().unwrap()["backend"], "weather");
    }
}
