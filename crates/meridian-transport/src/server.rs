//! HTTP and native RPC listeners using Axum.
//!
//! The HTTP listener hands every request to [`HttpHandler`] through a single
//! fallback route; routing is the server's job. The RPC listener upgrades
//! `/rpc` to a WebSocket and speaks JSON-RPC 2.0 over it, dispatching each
//! message on its own task so slow calls never block a connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    body::to_bytes,
    extract::{
        Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use meridian_protocol::{
    HandlerResult, MetadataMap, RequestId, RpcRequest, RpcResponse, ServiceError,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::request::{HttpRequest, HttpResponse};

/// Implemented by the server for calls arriving over the native RPC listener.
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle one call. `method` is the full `"Service/Method"` name.
    fn handle_rpc(
        &self,
        method: &str,
        metadata: MetadataMap,
        params: Option<serde_json::Value>,
    ) -> impl std::future::Future<Output = HandlerResult> + Send;
}

/// Implemented by the server for requests arriving over the HTTP listener.
pub trait HttpHandler: Send + Sync + 'static {
    fn handle_http(
        &self,
        request: HttpRequest,
    ) -> impl std::future::Future<Output = HttpResponse> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid listen address {addr}: {source}")]
    Addr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("{listener} listener failed: {message}")]
    Serve {
        listener: &'static str,
        message: String,
    },
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Hostname to bind to
    pub hostname: String,
    /// REST port (0 for OS-assigned, None to disable)
    pub http_port: Option<u16>,
    /// Native RPC port (0 for OS-assigned, None to disable)
    pub rpc_port: Option<u16>,
    /// Maximum concurrent RPC connections
    pub max_connections: Option<usize>,
    /// Enable CORS on the HTTP listener
    pub enable_cors: bool,
    /// Largest HTTP body read before the request is rejected
    pub max_body_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".into(),
            http_port: Some(8080),
            rpc_port: Some(8081),
            max_connections: Some(256),
            enable_cors: false,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

struct HttpState<H> {
    handler: Arc<H>,
    max_body_bytes: usize,
}

struct RpcState<H> {
    handler: Arc<H>,
    max_connections: Option<usize>,
    client_count: AtomicUsize,
    shutdown_rx: watch::Receiver<bool>,
}

/// Triggers graceful shutdown of every listener of one [`TransportServer`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// Owns the bound listeners and their serve tasks.
pub struct TransportServer {
    http_port: Option<u16>,
    rpc_port: Option<u16>,
    shutdown: ShutdownHandle,
    tasks: Vec<JoinHandle<Result<(), TransportError>>>,
}

impl TransportServer {
    /// Bind every enabled listener, then start serving. Nothing is served
    /// unless all binds succeed.
    pub async fn start<H>(config: TransportConfig, handler: Arc<H>) -> Result<Self, TransportError>
    where
        H: RpcHandler + HttpHandler,
    {
        let http_listener = match config.http_port {
            Some(port) => Some(bind(&config.hostname, port).await?),
            None => None,
        };
        let rpc_listener = match config.rpc_port {
            Some(port) => Some(bind(&config.hostname, port).await?),
            None => None,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut http_port = None;
        let mut rpc_port = None;

        if let Some(listener) = http_listener {
            let port = local_port(&listener)?;
            http_port = Some(port);
            let state = Arc::new(HttpState {
                handler: handler.clone(),
                max_body_bytes: config.max_body_bytes,
            });
            let mut app = Router::new()
                .fallback(http_fallback::<H>)
                .with_state(state);
            if config.enable_cors {
                app = app.layer(CorsLayer::permissive());
            }
            info!("HTTP listener on http://{}:{port}", config.hostname);
            tasks.push(spawn_serve("http", listener, app, shutdown_rx.clone()));
        }

        if let Some(listener) = rpc_listener {
            let port = local_port(&listener)?;
            rpc_port = Some(port);
            let state = Arc::new(RpcState {
                handler,
                max_connections: config.max_connections,
                client_count: AtomicUsize::new(0),
                shutdown_rx: shutdown_rx.clone(),
            });
            let app = Router::new()
                .route("/rpc", get(ws_upgrade_handler::<H>))
                .route("/health", get(health_handler::<H>))
                .with_state(state);
            info!("RPC listener on ws://{}:{port}/rpc", config.hostname);
            tasks.push(spawn_serve("rpc", listener, app, shutdown_rx));
        }

        Ok(Self {
            http_port,
            rpc_port,
            shutdown: ShutdownHandle(Arc::new(shutdown_tx)),
            tasks,
        })
    }

    /// Actual bound HTTP port, if the listener is enabled.
    pub fn http_port(&self) -> Option<u16> {
        self.http_port
    }

    /// Actual bound RPC port, if the listener is enabled.
    pub fn rpc_port(&self) -> Option<u16> {
        self.rpc_port
    }

    /// Stop accepting and let in-flight requests drain.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn abort_handles(&self) -> Vec<AbortHandle> {
        self.tasks.iter().map(JoinHandle::abort_handle).collect()
    }

    /// Wait for every listener to finish. An aborted listener counts as a
    /// clean stop; the first listener failure is returned.
    pub async fn join(self) -> Result<(), TransportError> {
        let mut first_err = None;
        for task in self.tasks {
            let outcome = match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(TransportError::Serve {
                    listener: "transport",
                    message: e.to_string(),
                }),
            };
            if let Err(e) = outcome {
                error!("{e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Graceful shutdown, then wait for the listeners.
    pub async fn stop(self) -> Result<(), TransportError> {
        self.shutdown();
        let result = self.join().await;
        info!("Transport stopped");
        result
    }
}

async fn bind(hostname: &str, port: u16) -> Result<TcpListener, TransportError> {
    let text = format!("{hostname}:{port}");
    let addr: SocketAddr = text
        .parse()
        .map_err(|source| TransportError::Addr { addr: text, source })?;
    TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::Bind { addr, source })
}

fn local_port(listener: &TcpListener) -> Result<u16, TransportError> {
    listener
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| TransportError::Serve {
            listener: "transport",
            message: e.to_string(),
        })
}

fn spawn_serve(
    name: &'static str,
    listener: TcpListener,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<Result<(), TransportError>> {
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            })
            .await
            .map_err(|e| TransportError::Serve {
                listener: name,
                message: e.to_string(),
            })
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn http_fallback<H: HttpHandler>(
    State(state): State<Arc<HttpState<H>>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            debug!("Rejected {} {}: {e}", parts.method, parts.uri.path());
            let err = ServiceError::invalid_request(format!("unreadable request body: {e}"));
            return (StatusCode::PAYLOAD_TOO_LARGE, HttpResponse::error(&err)).into_response();
        }
    };
    let request = HttpRequest::from_parts(parts.method, &parts.uri, parts.headers, body);
    state.handler.handle_http(request).await.into_response()
}

async fn ws_upgrade_handler<H: RpcHandler>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RpcState<H>>>,
) -> impl IntoResponse {
    // Check connection limit
    if let Some(max) = state.max_connections {
        let current = state.client_count.load(Ordering::Relaxed);
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn health_handler<H: RpcHandler>(State(state): State<Arc<RpcState<H>>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.client_count.load(Ordering::Relaxed),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws_connection<H: RpcHandler>(socket: WebSocket, state: Arc<RpcState<H>>) {
    state.client_count.fetch_add(1, Ordering::Relaxed);

    let client_id = uuid::Uuid::new_v4().to_string();
    debug!("Client connected: {client_id}");

    let (mut ws_tx, mut ws_rx) = socket.split();
    // Replies from per-call tasks funnel through one writer.
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(64);
    let mut shutdown_rx = state.shutdown_rx.clone();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let state = state.clone();
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            let response =
                                handle_message(text.as_str(), state.handler.as_ref()).await;
                            let _ = reply_tx.send(response).await;
                        });
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client disconnected: {client_id}");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {client_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            Some(reply) = reply_rx.recv() => {
                if let Err(e) = ws_tx.send(Message::Text(reply.into())).await {
                    error!("Failed to send response to {client_id}: {e}");
                    break;
                }
            }

            // The watch guard must drop before the close frame is sent.
            _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.client_count.fetch_sub(1, Ordering::Relaxed);
    debug!(
        "Client {client_id} closed (total: {})",
        state.client_count.load(Ordering::Relaxed)
    );
}

async fn handle_message<H: RpcHandler>(text: &str, handler: &H) -> String {
    let parsed: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            return encode(RpcResponse::error(
                None,
                ServiceError::parse_error("Failed to parse JSON"),
            ));
        }
    };

    let id: Option<RequestId> = parsed
        .get("id")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok());

    let request: RpcRequest = match serde_json::from_value(parsed) {
        Ok(req) => req,
        Err(_) => {
            return encode(RpcResponse::error(
                id,
                ServiceError::invalid_request("Invalid JSON-RPC 2.0 request"),
            ));
        }
    };
    if !request.is_valid() {
        return encode(RpcResponse::error(
            Some(request.id),
            ServiceError::invalid_request("Invalid JSON-RPC 2.0 request"),
        ));
    }

    let result = handler
        .handle_rpc(&request.method, request.metadata, request.params)
        .await;
    encode(RpcResponse::from_result(Some(request.id), result))
}

fn encode(response: RpcResponse) -> String {
    serde_json::to_string(&response).unwrap_or_else(|e| {
        error!("Failed to serialize response: {e}");
        r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"response serialization failed"}}"#
            .to_string()
    })
}
