//! Outbound connection to a configured peer
//!
//! Dials `{url}/{local_node_id}`, registers the socket as the direct route
//! to the peer and redials with exponential backoff whenever it drops.

use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{info, warn};

use super::node_server::pump;
use crate::application::router::SharedRouter;
use crate::application::routing::{basic_auth_header, Connection};
use crate::domain::ids::NodeId;
use crate::support::retry::{retry_with_backoff, RetryConfig};
use crate::support::shutdown::ShutdownSignal;

pub struct PeerClient {
    peer: NodeId,
    url: String,
    router: SharedRouter,
    subprotocols: Vec<String>,
    outbound_queue_capacity: usize,
    retry: RetryConfig,
}

impl PeerClient {
    pub fn new(peer: NodeId, url: impl Into<String>, router: SharedRouter) -> Self {
        Self {
            peer,
            url: url.into(),
            router,
            subprotocols: Vec::new(),
            outbound_queue_capacity: 256,
            retry: RetryConfig::reconnect(),
        }
    }

    pub fn with_subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.subprotocols = subprotocols;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Full URL dialled, with the local node id appended.
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), self.router.local_id())
    }

    /// Keep the peer connected until shutdown.
    pub fn start(self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(peer = %self.peer, url = %self.endpoint(), "🔗 Peer client started");
            loop {
                let connected = tokio::select! {
                    result = self.connect() => result,
                    _ = shutdown.wait() => break,
                };
                match connected {
                    Ok(ws_stream) => {
                        let (connection, outbound) = Connection::channel(self.outbound_queue_capacity, Some(self.url.clone()));
                        let connection_id = self.router.connection_opened(connection, Some(self.peer.clone()));
                        info!(peer = %self.peer, %connection_id, "🔗 Connected to peer");

                        let label = format!("{}:{}", self.peer, connection_id);
                        pump(ws_stream, outbound, &self.router, connection_id, &label, Some(shutdown.clone())).await;
                        self.router.connection_closed(connection_id);
                    }
                    Err(e) => warn!(peer = %self.peer, error = %e, "Peer connection failed"),
                }

                if shutdown.is_triggered() {
                    break;
                }
                warn!(peer = %self.peer, "Peer connection lost; reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(self.retry.initial_delay) => {},
                    _ = shutdown.wait() => break,
                }
            }
            info!(peer = %self.peer, "🔗 Peer client stopped");
        })
    }

    async fn connect(
        &self,
    ) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, WsError> {
        let operation = format!("connect to {}", self.peer);
        retry_with_backoff(
            self.retry.clone(),
            || async {
                let request = self.handshake_request()?;
                let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
                Ok::<_, WsError>(ws_stream)
            },
            is_transient,
            &operation,
        )
        .await
    }

    fn handshake_request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, WsError> {
        let mut request = self.endpoint().into_client_request()?;
        let headers = request.headers_mut();
        if !self.subprotocols.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.subprotocols.join(", ")) {
                headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
        }
        if let Some(secret) = self.router.credentials().secret_for(&self.peer) {
            let auth = basic_auth_header(self.router.local_id().as_str(), &secret);
            if let Ok(value) = HeaderValue::from_str(&auth) {
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        Ok(request)
    }
}

/// Refused credentials and bad URLs will not fix themselves.
fn is_transient(error: &WsError) -> bool {
    match error {
        WsError::Http(response) => !matches!(response.status().as_u16(), 401 | 403 | 404),
        WsError::Url(_) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use crate::application::router::{ProtocolRouter, RouterConfig};
    use crate::application::routing::{CredentialStore, RoutingTable};
    use crate::interfaces::ws::node_server::{NodeServer, NodeServerConfig};

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn router(local: &str) -> SharedRouter {
        Arc::new(ProtocolRouter::new(
            RouterConfig::default(),
            Arc::new(RoutingTable::new(node(local))),
            Arc::new(CredentialStore::new()),
        ))
    }

    #[test]
    fn endpoint_appends_local_id() {
        let client = PeerClient::new(node("HUB"), "ws://hub:9000/ocpp/", router("ST-1"));
        assert_eq!(client.endpoint(), "ws://hub:9000/ocpp/ST-1");
    }

    #[test]
    fn handshake_carries_basic_credentials() {
        let local = router("ST-1");
        local.credentials().set(node("HUB"), "s3cret");
        let client = PeerClient::new(node("HUB"), "ws://hub:9000/ocpp", local)
            .with_subprotocols(vec!["ocpp2.1".into()]);
        let request = client.handshake_request().unwrap();
        assert_eq!(
            request.headers().get(header::AUTHORIZATION).unwrap(),
            basic_auth_header("ST-1", "s3cret").as_str()
        );
        assert_eq!(request.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(), "ocpp2.1");
    }

    #[test]
    fn auth_failures_are_permanent() {
        let mut response = tokio_tungstenite::tungstenite::http::Response::new(None);
        *response.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
        assert!(!is_transient(&WsError::Http(response)));
        assert!(is_transient(&WsError::ConnectionClosed));
    }

    #[tokio::test]
    async fn both_ends_see_each_other() {
        let hub = router("HUB");
        hub.credentials().set(node("ST-1"), "s3cret");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();
        let server = NodeServer::new(
            NodeServerConfig {
                address: addr.to_string(),
                subprotocols: vec!["ocpp2.1".into()],
                outbound_queue_capacity: 16,
            },
            Arc::clone(&hub),
        )
        .with_shutdown(shutdown.clone());
        tokio::spawn(async move { server.serve(listener).await });

        let station = router("ST-1");
        station.credentials().set(node("HUB"), "s3cret");
        let task = PeerClient::new(node("HUB"), format!("ws://{addr}/ocpp"), Arc::clone(&station))
            .with_subprotocols(vec!["ocpp2.1".into()])
            .start(shutdown.clone());

        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.routes().direct(&node("ST-1")).is_none()
                || station.routes().direct(&node("HUB")).is_none()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
