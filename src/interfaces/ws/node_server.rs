//! Mesh node WebSocket server
//!
//! Accepts neighbour connections at `ws://<host>:<port>/ocpp/{node_id}` or
//! `ws://<host>:<port>/{node_id}`. A connection without an id in its path
//! (and without Basic credentials) is anonymous until its first verified
//! message.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::application::router::SharedRouter;
use crate::application::routing::{parse_basic_auth, AuthError, Connection};
use crate::domain::ids::{IdError, NodeId};
use crate::support::frame::Frame;
use crate::support::shutdown::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct NodeServerConfig {
    pub address: String,
    /// Offered subprotocols, most preferred first.
    pub subprotocols: Vec<String>,
    pub outbound_queue_capacity: usize,
}

pub struct NodeServer {
    config: NodeServerConfig,
    router: SharedRouter,
    shutdown_signal: Option<ShutdownSignal>,
}

impl NodeServer {
    pub fn new(config: NodeServerConfig, router: SharedRouter) -> Self {
        Self {
            config,
            router,
            shutdown_signal: None,
        }
    }

    /// Set the shutdown signal for graceful shutdown
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown_signal = Some(signal);
        self
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.address).await?;
        info!("🔌 Mesh node {} listening on ws://{}", self.router.local_id(), self.config.address);
        info!(
            "   Neighbours should connect to: ws://{}/ocpp/{{node_id}}",
            self.config.address
        );
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let shutdown = self.shutdown_signal.clone().unwrap_or_default();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = shutdown.wait() => {
                    info!("🛑 WebSocket server received shutdown signal");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let router = self.router.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown_signal.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, router, config, shutdown).await {
                warn!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

// ── Handshake ──────────────────────────────────────────────────

/// Node id from `/ocpp/{node_id}` or `/{node_id}`; `Ok(None)` for `/` or `/ocpp`.
pub fn node_id_from_path(path: &str) -> Result<Option<NodeId>, IdError> {
    let path = path.trim_matches('/');
    let raw = match path.strip_prefix("ocpp") {
        Some(rest) if rest.is_empty() => return Ok(None),
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => path,
    };
    if raw.is_empty() {
        return Ok(None);
    }
    NodeId::new(raw).map(Some)
}

/// First locally supported protocol the client also offered.
pub fn negotiate_subprotocol<'a>(requested: &str, supported: &'a [String]) -> Option<&'a str> {
    let requested: Vec<&str> = requested.split(',').map(str::trim).collect();
    supported
        .iter()
        .find(|candidate| requested.contains(&candidate.as_str()))
        .map(String::as_str)
}

/// Decide who is connecting. Basic credentials, when present, must name the
/// same node as the path.
pub fn authorize(
    router: &SharedRouter,
    path_id: Option<NodeId>,
    authorization: Option<&str>,
) -> Result<Option<NodeId>, AuthError> {
    let basic = authorization.and_then(parse_basic_auth);
    let (identity, password) = match (path_id, basic) {
        (Some(node), Some((user, password))) => {
            if user != node.as_str() {
                return Err(AuthError::Invalid(node));
            }
            (node, Some(password))
        }
        (Some(node), None) => (node, None),
        (None, Some((user, password))) => match NodeId::new(&user) {
            Ok(node) => (node, Some(password)),
            Err(_) => return Ok(None),
        },
        (None, None) => return Ok(None),
    };
    router.authenticate(&identity, password.as_deref())?;
    Ok(Some(identity))
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    if status == StatusCode::UNAUTHORIZED {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"mesh\""));
    }
    response
}

// ── Connection ─────────────────────────────────────────────────

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: SharedRouter,
    config: NodeServerConfig,
    shutdown: Option<ShutdownSignal>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    debug!("New connection from: {}", addr);
    let mut identity: Option<NodeId> = None;

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut response: Response| {
        let path = req.uri().path();
        let path_id = node_id_from_path(path).map_err(|e| reject(StatusCode::BAD_REQUEST, e.to_string()))?;

        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        identity = authorize(&router, path_id, authorization).map_err(|e| {
            warn!(%addr, path, error = %e, "Handshake rejected");
            reject(StatusCode::UNAUTHORIZED, e.to_string())
        })?;

        let requested = req
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        match negotiate_subprotocol(requested, &config.subprotocols) {
            Some(protocol) => {
                if let Ok(value) = HeaderValue::from_str(protocol) {
                    response.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                }
                debug!(%addr, protocol, "Subprotocol accepted");
            }
            None if !requested.is_empty() => {
                warn!(%addr, requested, "No common subprotocol");
            }
            None => {}
        }
        Ok(response)
    })
    .await?;

    let (connection, outbound) = Connection::channel(config.outbound_queue_capacity, Some(addr.to_string()));
    let connection_id = router.connection_opened(connection, identity);
    let label = connection_id.to_string();

    pump(ws_stream, outbound, &router, connection_id, &label, shutdown).await;

    router.connection_closed(connection_id);
    Ok(())
}

/// Shuttle frames between a WebSocket and the router until either side
/// stops or shutdown fires. Shared by inbound and outbound connections.
pub(crate) async fn pump<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut outbound: tokio::sync::mpsc::Receiver<Frame>,
    router: &SharedRouter,
    connection_id: crate::application::routing::ConnectionId,
    label: &str,
    shutdown: Option<ShutdownSignal>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Outgoing frame writer
    let send_label = label.to_string();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(bytes) => Message::Binary(bytes),
            };
            if let Err(e) = ws_sender.send(message).await {
                warn!("[{}] Send error: {}", send_label, e);
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let recv = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => router.handle_frame(connection_id, Frame::Text(text)),
                Ok(Message::Binary(bytes)) => router.handle_frame(connection_id, Frame::Binary(bytes)),
                Ok(Message::Close(frame)) => {
                    debug!("[{}] Close frame received: {:?}", label, frame);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => {
                    warn!("[{}] WebSocket error: {}", label, e);
                    break;
                }
            }
        }
    };

    let shutdown = shutdown.unwrap_or_default();
    tokio::select! {
        _ = recv => {},
        _ = shutdown.wait() => {
            info!("[{}] Connection closing due to shutdown", label);
        }
    }
    send_task.abort();
}
