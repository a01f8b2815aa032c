//! Client-facing MCP server.
//!
//! The broker is the default destination for everything that is not a
//! routed `tools/call`: it mints gateway sessions on `initialize`, serves
//! the aggregated catalog on `tools/list`, holds each client's
//! notification GET stream, terminates sessions on DELETE, and exposes
//! the per-backend validation records on `/status`. It never talks to a
//! backend on a client's behalf.

pub mod allowed;
pub mod notifications;

pub use allowed::{AllowedTools, TrustedHeaderFilter};
pub use notifications::NotificationHub;

use crate::config::BrokerSettings;
use crate::error::{Error, Result};
use crate::observer::ConfigObserver;
use crate::protocol::{
    self, Implementation, InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, McpMessage, McpMethod, ServerCapabilities, ToolsCapability, ToolsListResult,
    error_codes, headers,
};
use crate::registry::{ToolRecord, ToolRegistry};
use crate::session::{SessionCache, SessionClaims, SessionSigner};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_util::sync::CancellationToken;

type BoxedBody = BoxBody<Bytes, Infallible>;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// One dispatched JSON-RPC reply, plus the session header to set.
struct Reply {
    response: JsonRpcResponse,
    session: Option<String>,
}

impl Reply {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self { response: JsonRpcResponse::success(id, result), session: None }
    }

    fn err(id: Option<Value>, error: &Error) -> Self {
        Self { response: JsonRpcResponse::failure(id, JsonRpcError::from_gateway(error)), session: None }
    }
}

/// The client-facing MCP endpoint.
pub struct Broker {
    settings: BrokerSettings,
    signer: Arc<SessionSigner>,
    registry: Arc<ToolRegistry>,
    observer: Arc<ConfigObserver>,
    cache: Arc<SessionCache>,
    hub: Arc<NotificationHub>,
    filter: Option<TrustedHeaderFilter>,
}

impl Broker {
    /// Assemble the broker from its collaborators.
    pub fn new(
        settings: BrokerSettings,
        signer: Arc<SessionSigner>,
        registry: Arc<ToolRegistry>,
        observer: Arc<ConfigObserver>,
        cache: Arc<SessionCache>,
        hub: Arc<NotificationHub>,
        filter: Option<TrustedHeaderFilter>,
    ) -> Self {
        Self { settings, signer, registry, observer, cache, hub, filter }
    }

    /// Accept and serve client connections until cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.settings.listen).await.map_err(|e| {
            Error::Config(format!("broker failed to bind {}: {e}", self.settings.listen))
        })?;
        self.serve_on(listener, cancel).await
    }

    /// Serve on an already-bound listener (port 0 callers bind themselves).
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible to match [`Broker::serve`].
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            addr = ?listener.local_addr().ok(),
            hostname = %self.settings.public_hostname,
            "Broker listening"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "New client connection");
                        let broker = Arc::clone(&self);
                        let conn_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let broker = Arc::clone(&broker);
                                async move { Ok::<_, Infallible>(broker.handle(req).await) }
                            });
                            let mut conn = pin!(http1::Builder::new().serve_connection(io, service));
                            tokio::select! {
                                result = conn.as_mut() => {
                                    if let Err(e) = result {
                                        tracing::debug!(%addr, error = %e, "Connection ended with error");
                                    }
                                }
                                () = conn_cancel.cancelled() => {}
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }

        tracing::info!("Broker stopped");
        Ok(())
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        let path = req.uri().path().to_string();
        match (req.method().clone(), path.as_str()) {
            (Method::POST, "/mcp") => self.handle_post(req).await,
            (Method::GET, "/mcp") => self.handle_stream(&req),
            (Method::DELETE, "/mcp") => self.handle_delete(req.headers()).await,
            (Method::GET, "/status") => self.handle_status().await,
            _ => status_response(StatusCode::NOT_FOUND),
        }
    }

    async fn handle_post(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        let (parts, body) = req.into_parts();
        let bytes = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();

        match McpMessage::from_bytes(&bytes) {
            Ok(McpMessage::Request(request)) => {
                let reply = self.dispatch(&parts.headers, request).await;
                rpc_response(reply)
            }
            Ok(McpMessage::Notification(notification)) => {
                tracing::debug!(method = %notification.method, "Client notification");
                status_response(StatusCode::ACCEPTED)
            }
            Ok(McpMessage::Response(_)) => status_response(StatusCode::ACCEPTED),
            Err(e) => {
                let body = JsonRpcResponse::failure(None, JsonRpcError::from_gateway(&e));
                json_response(StatusCode::BAD_REQUEST, &body)
            }
        }
    }

    /// Dispatch one JSON-RPC request from a client.
    async fn dispatch(&self, headers: &HeaderMap, request: JsonRpcRequest) -> Reply {
        let id = request.id.clone();
        match McpMethod::parse(&request.method) {
            McpMethod::Initialize => self.handle_initialize(id, request.params),
            McpMethod::Ping => Reply::ok(id, json!({})),
            McpMethod::ToolsList => match self.require_session(headers) {
                Ok(_) => self.handle_tools_list(id, headers).await,
                Err(e) => Reply::err(id, &e),
            },
            McpMethod::ToolsCall => match self.require_session(headers) {
                // A tools/call that reaches the broker was not claimed by
                // any backend: the router forwards everything routable.
                Ok(_) => {
                    let name = request
                        .params
                        .as_ref()
                        .and_then(|p| p.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or("<missing>");
                    Reply::err(id, &Error::Unroutable(name.to_string()))
                }
                Err(e) => Reply::err(id, &e),
            },
            // Request-shaped notifications are tolerated with an empty
            // success so lenient clients keep working.
            McpMethod::Initialized | McpMethod::Notification(_) => Reply::ok(id, json!({})),
            McpMethod::Other(method) => Reply {
                response: JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(
                        error_codes::METHOD_NOT_FOUND,
                        format!("Method not found: {method}"),
                    ),
                ),
                session: None,
            },
        }
    }

    fn handle_initialize(&self, id: Option<Value>, params: Option<Value>) -> Reply {
        let requested = params.and_then(|p| serde_json::from_value::<InitializeParams>(p).ok());
        // Echo an accepted client version; otherwise answer with ours.
        let version = requested
            .as_ref()
            .map(|p| p.protocol_version.as_str())
            .filter(|v| protocol::ACCEPTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(protocol::LATEST_PROTOCOL_VERSION)
            .to_string();

        let token = match self.signer.generate() {
            Ok(token) => token,
            Err(e) => return Reply::err(id, &e),
        };

        let result = InitializeResult {
            protocol_version: version,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: Some(true) }),
                other: serde_json::Map::new(),
            },
            server_info: Some(Implementation {
                name: "conduit".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        };

        let client = requested.and_then(|p| p.client_info.map(|i| i.name));
        tracing::info!(client = ?client, "Client session created");
        match serde_json::to_value(&result) {
            Ok(value) => Reply { response: JsonRpcResponse::success(id, value), session: Some(token) },
            Err(e) => Reply::err(id, &Error::Json(e)),
        }
    }

    async fn handle_tools_list(&self, id: Option<Value>, headers: &HeaderMap) -> Reply {
        let records = self.registry.list_all().await;
        let records = self.apply_trusted_header(records, headers).await;

        let result = ToolsListResult {
            tools: records.iter().map(ToolRecord::descriptor).collect(),
            next_cursor: None,
        };
        match serde_json::to_value(&result) {
            Ok(value) => Reply::ok(id, value),
            Err(e) => Reply::err(id, &Error::Json(e)),
        }
    }

    /// Narrow the catalog by the `x-allowed-tools` header, when filtering
    /// is configured and the header is present. A token that fails
    /// verification hides everything.
    async fn apply_trusted_header(
        &self,
        records: Vec<ToolRecord>,
        headers: &HeaderMap,
    ) -> Vec<ToolRecord> {
        let (Some(filter), Some(header)) = (self.filter.as_ref(), headers.get(headers::ALLOWED_TOOLS))
        else {
            return records;
        };

        let decoded = header.to_str().ok().and_then(|token| match filter.decode(token) {
            Ok(allow) => Some(allow),
            Err(e) => {
                tracing::warn!(error = %e, "Rejected x-allowed-tools header");
                None
            }
        });
        match decoded {
            Some(allow) => {
                let hostnames: HashMap<String, String> = self
                    .registry
                    .routes()
                    .await
                    .into_iter()
                    .map(|route| (route.backend, route.hostname))
                    .collect();
                allow.filter(records, &hostnames)
            }
            None => Vec::new(),
        }
    }

    fn handle_stream(&self, req: &Request<Incoming>) -> Response<BoxedBody> {
        // Per streamable HTTP semantics, an unknown session on the
        // listener is a 404: the client must re-initialize.
        if self.require_session(req.headers()).is_err() {
            return status_response(StatusCode::NOT_FOUND);
        }

        let events = BroadcastStream::new(self.hub.subscribe()).filter_map(|item| match item {
            Ok(notification) => serde_json::to_string(&notification)
                .ok()
                .map(|json| Ok::<_, Infallible>(Frame::data(Bytes::from(format!("data: {json}\n\n"))))),
            // A lagged client missed notifications; skip and continue.
            Err(_) => None,
        });
        let keepalive = IntervalStream::new(tokio::time::interval(KEEPALIVE_INTERVAL))
            .map(|_| Ok::<_, Infallible>(Frame::data(Bytes::from_static(b": keep-alive\n\n"))));

        let body = BodyExt::boxed(StreamBody::new(futures::stream::select(events, keepalive)));
        let mut response = Response::new(body);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        response.headers_mut().insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
    }

    async fn handle_delete(&self, headers: &HeaderMap) -> Response<BoxedBody> {
        let Some(token) = headers.get(headers::SESSION_ID).and_then(|v| v.to_str().ok()) else {
            return status_response(StatusCode::NOT_FOUND);
        };
        if self.signer.validate(token).is_err() {
            return status_response(StatusCode::NOT_FOUND);
        }

        self.signer.terminate(token);
        // The router's lazily created backend sessions die with the
        // gateway session.
        self.cache.invalidate_gateway_session(token).await;
        tracing::info!("Gateway session terminated by client");
        status_response(StatusCode::NO_CONTENT)
    }

    async fn handle_status(&self) -> Response<BoxedBody> {
        let records = self.observer.status().await;
        json_response(StatusCode::OK, &records)
    }

    fn require_session(&self, headers: &HeaderMap) -> Result<SessionClaims> {
        let token = headers
            .get(headers::SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::SessionInvalid("missing mcp-session-id header".to_string()))?;
        self.signer.validate(token)
    }
}

fn full_body(bytes: impl Into<Bytes>) -> BoxedBody {
    Full::new(bytes.into()).boxed()
}

fn status_response(status: StatusCode) -> Response<BoxedBody> {
    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<BoxedBody> {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut response = Response::new(full_body(bytes));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn rpc_response(reply: Reply) -> Response<BoxedBody> {
    let mut response = json_response(StatusCode::OK, &reply.response);
    if let Some(session) = reply.session {
        if let Ok(value) = HeaderValue::from_str(&session) {
            response.headers_mut().insert(headers::SESSION_ID, value);
        }
    }
    response
}
