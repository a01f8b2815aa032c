//! MCP client for one backend connection.
//!
//! Wraps a single streamable HTTP connection: JSON-RPC requests go out as
//! POSTs, the backend's session id rides the `mcp-session-id` header, and
//! server-initiated notifications arrive on a long-lived GET event stream.
//! Every outbound request carries the broker's user-agent, the backend's
//! identity, and the configured credential.

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    self, Implementation, InitializeParams, InitializeResult, JsonRpcRequest, JsonRpcResponse,
    McpMessage, ToolDescriptor, ToolsListResult, headers,
};
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Event surfaced by a backend's notification stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// The backend announced a changed resource list
    /// (`notifications/<resource>/list_changed`).
    ListChanged {
        /// Full notification method name.
        method: String,
    },
    /// The notification stream dropped; the connection is suspect.
    ConnectionLost,
}

/// MCP client bound to one backend.
pub struct UpstreamClient {
    backend: String,
    endpoint: reqwest::Url,
    http: reqwest::Client,
    timeout: Duration,
    session_id: Option<String>,
    init_result: Option<InitializeResult>,
    request_id: AtomicU64,
}

impl UpstreamClient {
    /// Build a client for the backend. Does not connect.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URL is unparseable or the
    /// credential cannot be resolved; both are fatal for the backend.
    pub fn new(config: &BackendConfig, timeout: Duration) -> Result<Self> {
        let endpoint = config.parsed_url()?;

        let mut default_headers = HeaderMap::new();
        let agent = format!("conduit-broker/{}", env!("CARGO_PKG_VERSION"));
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&agent)
                .map_err(|e| Error::Config(format!("invalid user agent: {e}")))?,
        );
        default_headers.insert(
            HeaderName::from_static(headers::SERVER_ID),
            HeaderValue::from_str(&config.name).map_err(|e| {
                Error::Config(format!("backend name '{}' is not header-safe: {e}", config.name))
            })?,
        );
        if let Some(credential) = &config.credential {
            let value = credential.authorization_value()?;
            let mut header = HeaderValue::from_str(&value)
                .map_err(|e| Error::Config(format!("credential is not header-safe: {e}")))?;
            header.set_sensitive(true);
            default_headers.insert(AUTHORIZATION, header);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            backend: config.name.clone(),
            endpoint,
            http,
            timeout,
            session_id: None,
            init_result: None,
            request_id: AtomicU64::new(0),
        })
    }

    /// Open the connection: MCP `initialize` followed by the
    /// `notifications/initialized` handshake. The backend's session id, if
    /// it issues one, is captured from the response header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] when the transport or the initialize
    /// exchange fails. The caller decides whether to retry.
    pub async fn connect(&mut self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: protocol::LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Some(Implementation {
                name: "conduit-broker".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        };
        let request =
            JsonRpcRequest::new("initialize", Some(serde_json::to_value(&params)?), json!(self.next_id()));

        let response = self
            .http
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .header(ACCEPT, format!("application/json, {EVENT_STREAM_MIME}"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.connect_error(format!("initialize request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(self.connect_error(format!("initialize returned HTTP {}", response.status())));
        }

        self.session_id = response
            .headers()
            .get(headers::SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let rpc = self.read_rpc_response(response).await?;
        if let Some(error) = rpc.error {
            return Err(self.connect_error(format!(
                "initialize rejected: {} (code {})",
                error.message, error.code
            )));
        }
        let result: InitializeResult = serde_json::from_value(
            rpc.result.ok_or_else(|| self.connect_error("initialize response missing result"))?,
        )
        .map_err(|e| self.connect_error(format!("malformed initialize result: {e}")))?;

        self.notify("notifications/initialized").await?;
        self.init_result = Some(result.clone());

        tracing::info!(
            backend = %self.backend,
            protocol_version = %result.protocol_version,
            session = self.session_id.is_some(),
            "Connected to backend"
        );
        Ok(result)
    }

    /// Close the connection, terminating the backend session if one was
    /// issued. Best effort: the backend may already be gone.
    pub async fn disconnect(&mut self) {
        if self.session_id.is_some() {
            let mut request = self.http.delete(self.endpoint.clone()).timeout(self.timeout);
            if let Some(session) = &self.session_id {
                request = request.header(headers::SESSION_ID, session);
            }
            if let Err(e) = request.send().await {
                tracing::debug!(backend = %self.backend, error = %e, "Session delete failed");
            }
        }
        self.session_id = None;
        self.init_result = None;
    }

    /// Fetch the backend's full tool list, following pagination cursors.
    ///
    /// # Errors
    ///
    /// Returns an error if any page request fails or is malformed.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.request("tools/list", params).await?;
            let page: ToolsListResult = serde_json::from_value(result)
                .map_err(|e| Error::Protocol(format!("malformed tools/list result: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend does not answer the ping.
    pub async fn ping(&self) -> Result<()> {
        self.request("ping", None).await.map(|_| ())
    }

    /// The `InitializeResult` captured on connect.
    pub fn init_result(&self) -> Option<&InitializeResult> {
        self.init_result.as_ref()
    }

    /// The backend-issued session id, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Whether `connect` has completed on this client.
    pub fn is_connected(&self) -> bool {
        self.init_result.is_some()
    }

    /// Open the server-initiated notification stream and pump its events
    /// into `tx`. The task ends when the stream drops (after reporting
    /// [`UpstreamEvent::ConnectionLost`]) or when `cancel` fires. Backends
    /// without a server stream (the GET is rejected) produce no events.
    pub fn subscribe(
        &self,
        tx: mpsc::Sender<UpstreamEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let backend = self.backend.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            let mut request = http.get(endpoint).header(ACCEPT, EVENT_STREAM_MIME);
            if let Some(session) = &session_id {
                request = request.header(headers::SESSION_ID, session);
            }

            let response = tokio::select! {
                () = cancel.cancelled() => return,
                response = request.send() => response,
            };
            let response = match response {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    tracing::debug!(
                        backend = %backend,
                        status = %r.status(),
                        "Backend does not offer a notification stream"
                    );
                    return;
                }
                Err(e) => {
                    tracing::debug!(backend = %backend, error = %e, "Notification stream request failed");
                    let _ = tx.send(UpstreamEvent::ConnectionLost).await;
                    return;
                }
            };

            let mut parser = SseParser::new();
            let mut body = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => return,
                    chunk = body.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        for payload in parser.push(&bytes) {
                            if let Ok(McpMessage::Notification(notification)) =
                                McpMessage::from_bytes(payload.as_bytes())
                            {
                                if notification.method.ends_with("/list_changed") {
                                    let event =
                                        UpstreamEvent::ListChanged { method: notification.method };
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(backend = %backend, error = %e, "Notification stream error");
                        let _ = tx.send(UpstreamEvent::ConnectionLost).await;
                        return;
                    }
                    None => {
                        let _ = tx.send(UpstreamEvent::ConnectionLost).await;
                        return;
                    }
                }
            }
        })
    }

    /// Send one JSON-RPC request and return its result value.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let request = JsonRpcRequest::new(method, params, json!(self.next_id()));

        let mut builder = self
            .http
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .header(ACCEPT, format!("application/json, {EVENT_STREAM_MIME}"))
            .json(&request);
        if let Some(session) = &self.session_id {
            builder = builder.header(headers::SESSION_ID, session);
        }

        let response = builder.send().await.map_err(|e| Error::Connect {
            backend: self.backend.clone(),
            message: format!("request '{method}' failed: {e}"),
        })?;

        // 404 means the backend no longer recognizes our session.
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::SessionGone { backend: self.backend.clone() });
        }
        if !response.status().is_success() {
            return Err(Error::UpstreamStatus {
                backend: self.backend.clone(),
                status: response.status().as_u16(),
            });
        }

        let rpc = self.read_rpc_response(response).await?;
        if let Some(error) = rpc.error {
            return Err(Error::Protocol(format!(
                "request '{method}' failed: {} (code {})",
                error.message, error.code
            )));
        }
        rpc.result
            .ok_or_else(|| Error::Protocol(format!("response for '{method}' missing result")))
    }

    /// Send one JSON-RPC notification (no response body expected).
    async fn notify(&self, method: &str) -> Result<()> {
        let notification = json!({ "jsonrpc": "2.0", "method": method });
        let mut builder = self
            .http
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .json(&notification);
        if let Some(session) = &self.session_id {
            builder = builder.header(headers::SESSION_ID, session);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.connect_error(format!("notification '{method}' failed: {e}")))?;
        if !response.status().is_success() {
            return Err(self.connect_error(format!(
                "notification '{method}' returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Read a JSON-RPC response from a POST reply, which a streamable
    /// HTTP backend may deliver either as a plain JSON body or as an
    /// event stream carrying the response message.
    async fn read_rpc_response(&self, response: reqwest::Response) -> Result<JsonRpcResponse> {
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with(EVENT_STREAM_MIME));

        if !is_stream {
            return response.json::<JsonRpcResponse>().await.map_err(|e| {
                Error::Protocol(format!("backend '{}' sent a malformed response: {e}", self.backend))
            });
        }

        let mut parser = SseParser::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let bytes = chunk.map_err(|e| self.connect_error(format!("response stream error: {e}")))?;
            for payload in parser.push(&bytes) {
                // Interleaved notifications on the response stream are
                // skipped; only the response message ends the read.
                if let Ok(McpMessage::Response(rpc)) = McpMessage::from_bytes(payload.as_bytes()) {
                    return Ok(rpc);
                }
            }
        }
        Err(Error::Protocol(format!("backend '{}' closed the stream without a response", self.backend)))
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn connect_error(&self, message: impl Into<String>) -> Error {
        Error::Connect { backend: self.backend.clone(), message: message.into() }
    }
}

/// Incremental parser for `text/event-stream` bodies; yields the data
/// payload of each complete event.
struct SseParser {
    buffer: String,
    data: Vec<String>,
}

impl SseParser {
    fn new() -> Self {
        Self { buffer: String::new(), data: Vec::new() }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // id:, event:, retry: and comment lines are irrelevant here.
        }
        events
    }
}
