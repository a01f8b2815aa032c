//! Request-inspection sidecar in front of the HTTP proxy.
//!
//! The proxy mirrors every in-flight MCP request to the router's request
//! hook. The router parses the envelope and decides: pass it through to
//! the broker (everything that is not `tools/call`), reject it with a
//! JSON-RPC error, or rewrite it for a backend. Rewriting resolves the
//! tool prefix, translates the gateway session into a lazily created
//! backend session, strips the prefix from the tool name, and points the
//! request's authority at the backend's hostname. The response hook
//! watches routed calls for 404s, which invalidate the cached backend
//! session so the next call re-initializes.

use crate::config::RouterSettings;
use crate::error::{Error, Result};
use crate::protocol::{
    self, Implementation, InitializeParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    McpMessage, McpMethod, headers,
};
use crate::registry::{BackendRoute, ToolRegistry};
use crate::session::{SessionCache, SessionSigner};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::pin;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

type BoxedBody = BoxBody<Bytes, Infallible>;

/// What the proxy should do with an inspected request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum RouteDecision {
    /// Forward unchanged; the broker is the default destination.
    Continue,
    /// Steer to a backend with the given mutations applied.
    #[serde(rename_all = "camelCase")]
    Forward {
        /// Authority (`:authority` or Host) to route by.
        authority: String,
        /// Headers to set on the forwarded request.
        set_headers: HashMap<String, String>,
        /// Replacement request body.
        body: Value,
    },
    /// Answer the client directly without forwarding.
    #[serde(rename_all = "camelCase")]
    Reject {
        /// HTTP status for the reply.
        status: u16,
        /// JSON-RPC error reply body.
        body: JsonRpcResponse,
    },
}

/// What the proxy reports to the response hook for a routed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseObservation {
    /// HTTP status the backend answered with.
    pub status: u16,
    /// Backend the call was routed to.
    pub backend: String,
    /// Gateway session the call was made under.
    pub gateway_session: String,
}

/// What the proxy should do with an observed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ResponseDecision {
    /// Deliver the backend's response as-is.
    Continue,
    /// Replace the response; used to surface a retryable error after the
    /// backend rejected its session.
    #[serde(rename_all = "camelCase")]
    Replace {
        /// HTTP status for the replacement.
        status: u16,
        /// Replacement body.
        body: JsonRpcResponse,
    },
}

/// The request-inspection component.
pub struct Router {
    settings: RouterSettings,
    registry: Arc<ToolRegistry>,
    signer: Arc<SessionSigner>,
    cache: Arc<SessionCache>,
    http: reqwest::Client,
}

impl Router {
    /// Assemble the router from its collaborators.
    pub fn new(
        settings: RouterSettings,
        registry: Arc<ToolRegistry>,
        signer: Arc<SessionSigner>,
        cache: Arc<SessionCache>,
    ) -> Self {
        Self { settings, registry, signer, cache, http: reqwest::Client::new() }
    }

    /// Inspect one in-flight request and decide its fate.
    ///
    /// If the client drops while a backend initialization is in flight,
    /// the proxy drops the hook call, this future is cancelled, and the
    /// cache keeps nothing.
    pub async fn inspect_request(&self, request_headers: &HeaderMap, body: &[u8]) -> RouteDecision {
        // Our own hair-pinned initialize re-enters the proxy marked with
        // mcp-init-host; forward it straight to that backend.
        if let Some(host) = header_str(request_headers, headers::INIT_HOST) {
            return match serde_json::from_slice::<Value>(body) {
                Ok(passthrough) => RouteDecision::Forward {
                    authority: host.to_string(),
                    set_headers: HashMap::new(),
                    body: passthrough,
                },
                Err(e) => reject(None, &Error::Json(e)),
            };
        }

        let message = match McpMessage::from_bytes(body) {
            Ok(message) => message,
            Err(e) => return reject(None, &e),
        };
        let McpMessage::Request(request) = message else {
            return RouteDecision::Continue;
        };
        if McpMethod::parse(&request.method) != McpMethod::ToolsCall {
            return RouteDecision::Continue;
        }

        let id = request.id.clone();
        let Some(tool_name) = request
            .params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .map(String::from)
        else {
            return RouteDecision::Reject {
                status: StatusCode::OK.as_u16(),
                body: JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(
                        protocol::error_codes::INVALID_PARAMS,
                        "tools/call requires a 'name' parameter",
                    ),
                ),
            };
        };

        let route = match self.registry.resolve(&tool_name).await {
            Ok(route) => route,
            Err(e) => return reject(id, &e),
        };

        let Some(gateway_session) = header_str(request_headers, headers::SESSION_ID) else {
            return reject(
                id,
                &Error::SessionInvalid("missing mcp-session-id header".to_string()),
            );
        };
        if let Err(e) = self.signer.validate(gateway_session) {
            return reject(id, &e);
        }

        let authorization = header_str(request_headers, AUTHORIZATION.as_str()).map(String::from);
        let backend_session = match self
            .cache
            .get_or_init(&route.backend, gateway_session, || {
                self.hairpin_init(route.clone(), authorization)
            })
            .await
        {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(
                    backend = %route.backend,
                    tool = %tool_name,
                    error = %e,
                    "Backend session initialization failed"
                );
                return reject(id, &e);
            }
        };

        let body = match mutate_tool_name(body, &tool_name, &route) {
            Ok(body) => body,
            Err(e) => return reject(id, &e),
        };

        let mut set_headers = HashMap::new();
        set_headers.insert(headers::SERVER_ID.to_string(), route.backend.clone());
        if !backend_session.is_empty() {
            set_headers.insert(headers::SESSION_ID.to_string(), backend_session);
        }

        tracing::debug!(
            tool = %tool_name,
            backend = %route.backend,
            authority = %route.hostname,
            "Routed tool call"
        );
        RouteDecision::Forward { authority: route.hostname, set_headers, body }
    }

    /// React to a routed call's response status.
    pub async fn observe_response(&self, observation: &ResponseObservation) -> ResponseDecision {
        if observation.status != StatusCode::NOT_FOUND.as_u16() {
            return ResponseDecision::Continue;
        }

        // 404 is the backend saying "session not found": drop the cached
        // entry and hand the client a retryable error.
        tracing::info!(
            backend = %observation.backend,
            "Backend rejected its session, invalidating cache entry"
        );
        self.cache.invalidate(&observation.backend, &observation.gateway_session).await;

        let error = Error::SessionGone { backend: observation.backend.clone() };
        ResponseDecision::Replace {
            status: StatusCode::OK.as_u16(),
            body: JsonRpcResponse::failure(None, JsonRpcError::from_gateway(&error)),
        }
    }

    /// Initialize a backend session by hair-pinning a request back
    /// through the proxy, so any policy attached to the backend's route
    /// (auth in particular) applies to the initialize too.
    async fn hairpin_init(&self, route: BackendRoute, authorization: Option<String>) -> Result<String> {
        let params = InitializeParams {
            protocol_version: protocol::LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Some(Implementation {
                name: "conduit-router".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        };
        let request = JsonRpcRequest::new("initialize", Some(serde_json::to_value(&params)?), json!(1));

        let mut builder = self
            .http
            .post(&self.settings.proxy_url)
            .timeout(self.settings.init_timeout)
            .header(headers::INIT_HOST, &route.hostname)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&request);
        if let Some(auth) = &authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }

        let response = builder.send().await.map_err(|e| Error::Connect {
            backend: route.backend.clone(),
            message: format!("hair-pinned initialize failed: {e}"),
        })?;
        if !response.status().is_success() {
            return Err(Error::Connect {
                backend: route.backend.clone(),
                message: format!("hair-pinned initialize returned HTTP {}", response.status()),
            });
        }

        // A stateless backend may not issue a session id; cache the empty
        // marker so calls are forwarded without a session header.
        let backend_session = response
            .headers()
            .get(headers::SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        // Complete the handshake before the first tools/call goes out.
        let initialized = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        let mut builder = self
            .http
            .post(&self.settings.proxy_url)
            .timeout(self.settings.init_timeout)
            .header(headers::INIT_HOST, &route.hostname)
            .header(CONTENT_TYPE, "application/json")
            .json(&initialized);
        if !backend_session.is_empty() {
            builder = builder.header(headers::SESSION_ID, &backend_session);
        }
        if let Some(auth) = &authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.send().await.map_err(|e| Error::Connect {
            backend: route.backend.clone(),
            message: format!("initialized notification failed: {e}"),
        })?;

        tracing::info!(backend = %route.backend, "Initialized backend session");
        Ok(backend_session)
    }

    /// Serve the proxy-facing hook endpoints until cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.settings.listen).await.map_err(|e| {
            Error::Config(format!("router failed to bind {}: {e}", self.settings.listen))
        })?;
        self.serve_on(listener, cancel).await
    }

    /// Serve on an already-bound listener (port 0 callers bind themselves).
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible to match [`Router::serve`].
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), "Router hooks listening");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let router = Arc::clone(&self);
                        let conn_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let router = Arc::clone(&router);
                                async move { Ok::<_, Infallible>(router.handle(req).await) }
                            });
                            let mut conn = pin!(http1::Builder::new().serve_connection(io, service));
                            tokio::select! {
                                result = conn.as_mut() => {
                                    if let Err(e) = result {
                                        tracing::debug!(%addr, error = %e, "Hook connection error");
                                    }
                                }
                                () = conn_cancel.cancelled() => {}
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Error accepting hook connection");
                    }
                }
            }
        }

        tracing::info!("Router stopped");
        Ok(())
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        let path = req.uri().path().to_string();
        match (req.method().clone(), path.as_str()) {
            (Method::POST, "/hooks/request") => {
                let (parts, body) = req.into_parts();
                let bytes = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
                let decision = self.inspect_request(&parts.headers, &bytes).await;
                json_response(&decision)
            }
            (Method::POST, "/hooks/response") => {
                let bytes =
                    req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
                match serde_json::from_slice::<ResponseObservation>(&bytes) {
                    Ok(observation) => {
                        let decision = self.observe_response(&observation).await;
                        json_response(&decision)
                    }
                    Err(e) => {
                        let mut response = json_response(&json!({ "error": e.to_string() }));
                        *response.status_mut() = StatusCode::BAD_REQUEST;
                        response
                    }
                }
            }
            _ => {
                let mut response = Response::new(Full::new(Bytes::new()).boxed());
                *response.status_mut() = StatusCode::NOT_FOUND;
                response
            }
        }
    }
}

/// Build the rejection decision for a gateway error, with the HTTP status
/// the proxy should answer with.
fn reject(id: Option<Value>, error: &Error) -> RouteDecision {
    let status = match error {
        // Malformed envelope: a plain bad request.
        Error::Protocol(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        // Unknown or expired session: 404 tells the client to
        // re-initialize, mirroring backend session semantics.
        Error::SessionInvalid(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    RouteDecision::Reject {
        status: status.as_u16(),
        body: JsonRpcResponse::failure(id, JsonRpcError::from_gateway(error)),
    }
}

/// Rewrite `params.name` to the backend's original tool name.
fn mutate_tool_name(body: &[u8], tool_name: &str, route: &BackendRoute) -> Result<Value> {
    let stripped = tool_name.strip_prefix(route.tool_prefix.as_str()).unwrap_or(tool_name);
    let mut value: Value = serde_json::from_slice(body)?;
    if let Some(params) = value.get_mut("params") {
        if let Some(name) = params.get_mut("name") {
            *name = Value::String(stripped.to_string());
        }
    }
    Ok(value)
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn json_response<T: Serialize>(value: &T) -> Response<BoxedBody> {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(bytes)).boxed());
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
