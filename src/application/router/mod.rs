//! Protocol router
//!
//! Moves protocol messages between this node's local handlers and its
//! transport connections. Every inbound frame is decoded, checked, then
//! either dispatched locally, forwarded one hop closer to its destination,
//! or matched against a pending request.
//!
//! Outbound requests end in exactly one of: a response, a remote error,
//! `Unreachable` (detected at send time), a transport refusal, a timeout, or
//! a cancellation.
//!
//! Replies to relayed requests go back on the connection the request arrived
//! on, never by a fresh routing lookup.

pub mod error;
pub mod forwarded;
pub mod handler;
pub mod pending;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

pub use error::{DeliveryError, RpcError};
pub use forwarded::ForwardedRequests;
pub use handler::{FnHandler, HandlerRegistry, MessageHandler, RequestContext, SharedHandler};
pub use pending::{PendingGuard, PendingInfo, PendingRequests, ReplyResult};

use crate::application::routing::{
    AuthError, Connection, ConnectionId, CredentialStore, RoutingTable,
};
use crate::domain::events::{
    Event, MessageDroppedEvent, NodeConnectedEvent, NodeDisconnectedEvent, RequestTimedOutEvent,
};
use crate::domain::ids::{EventTrackingId, NodeId, RequestId};
use crate::domain::message::{
    ErrorCode, ErrorInfo, ErrorMessage, MessageHeader, Payload, ProtocolMessage, RequestMessage,
    ResponseMessage,
};
use crate::notifications::SharedEventBus;
use crate::support::frame::{self, DecodeContext, Frame};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_HOPS: usize = 8;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deadline for requests that do not set their own.
    pub request_timeout: Duration,
    /// Frames that already passed this many forwarders are dropped.
    pub max_hops: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

/// Per-call knobs for outbound messages.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    /// Continue an existing causality chain instead of starting a new one.
    pub event_tracking_id: Option<EventTrackingId>,
    pub custom_data: Option<Value>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn tracking(mut self, event_tracking_id: EventTrackingId) -> Self {
        self.event_tracking_id = Some(event_tracking_id);
        self
    }

    fn apply(self, header: &mut MessageHeader) -> Option<Duration> {
        if let Some(eid) = self.event_tracking_id {
            header.event_tracking_id = eid;
        }
        if self.custom_data.is_some() {
            header.custom_data = self.custom_data;
        }
        self.timeout
    }
}

struct ConnectionState {
    connection: Connection,
    identity: Option<NodeId>,
}

/// Admin view of a live connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub node_id: Option<NodeId>,
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Result of running a local handler for a request.
enum HandlerOutcome {
    Response(ResponseMessage),
    /// Refused before any handler ran.
    Rejected(ErrorMessage),
    /// The handler ran and failed.
    Failed(ErrorMessage),
}

impl HandlerOutcome {
    fn into_message(self) -> ProtocolMessage {
        match self {
            Self::Response(m) => ProtocolMessage::Response(m),
            Self::Rejected(m) => ProtocolMessage::RequestError(m),
            Self::Failed(m) => ProtocolMessage::ResponseError(m),
        }
    }

    fn into_result(self) -> ReplyResult {
        match self {
            Self::Response(m) => Ok(m),
            Self::Rejected(m) => Err(RpcError::RequestError(m)),
            Self::Failed(m) => Err(RpcError::ResponseError(m)),
        }
    }
}

pub type SharedRouter = Arc<ProtocolRouter>;

pub struct ProtocolRouter {
    local_id: NodeId,
    config: RouterConfig,
    routes: Arc<RoutingTable>,
    credentials: Arc<CredentialStore>,
    handlers: HandlerRegistry,
    pending: PendingRequests,
    forwarded: ForwardedRequests,
    connections: DashMap<ConnectionId, ConnectionState>,
    event_bus: Option<SharedEventBus>,
}

impl ProtocolRouter {
    /// The routing table decides the local node id.
    pub fn new(
        config: RouterConfig,
        routes: Arc<RoutingTable>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            local_id: routes.local_id().clone(),
            config,
            routes,
            credentials,
            handlers: HandlerRegistry::new(),
            pending: PendingRequests::new(),
            forwarded: ForwardedRequests::new(),
            connections: DashMap::new(),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: SharedEventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn register_handler(&self, action: impl Into<String>, handler: impl MessageHandler + 'static) {
        self.handlers.register(action, Arc::new(handler));
    }

    pub fn pending_requests(&self) -> Vec<PendingInfo> {
        self.pending.snapshot()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // ── Connection lifecycle ───────────────────────────────

    /// Register a transport connection. `identity` is the node the transport
    /// authenticated during the handshake; without one the connection stays
    /// anonymous until its first verified message.
    pub fn connection_opened(&self, connection: Connection, identity: Option<NodeId>) -> ConnectionId {
        let connection_id = connection.id();
        info!(
            %connection_id,
            node_id = ?identity,
            remote_addr = ?connection.remote_addr(),
            "Connection opened"
        );
        if let Some(node) = &identity {
            self.bind(node, &connection);
        }
        self.connections.insert(
            connection_id,
            ConnectionState {
                connection,
                identity,
            },
        );
        metrics::gauge!("mesh_connections").increment(1.0);
        connection_id
    }

    /// Check a credential presented at handshake time.
    pub fn authenticate(&self, node: &NodeId, presented: Option<&str>) -> Result<(), AuthError> {
        self.credentials.verify(node, presented)
    }

    /// Forget a connection. Requests waiting on replies through it keep
    /// waiting until their own deadline.
    pub fn connection_closed(&self, connection_id: ConnectionId) {
        let Some((_, state)) = self.connections.remove(&connection_id) else {
            return;
        };
        metrics::gauge!("mesh_connections").decrement(1.0);

        if let Some(node) = &state.identity {
            self.routes.detach(node, connection_id);
        }
        info!(%connection_id, node_id = ?state.identity, "Connection closed");
        self.publish(Event::NodeDisconnected(NodeDisconnectedEvent {
            node_id: state.identity,
            connection_id: connection_id.as_u64(),
            timestamp: Utc::now(),
        }));
    }

    pub fn connection_identity(&self, connection_id: ConnectionId) -> Option<NodeId> {
        self.connections.get(&connection_id)?.identity.clone()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| ConnectionInfo {
                connection_id: *entry.key(),
                node_id: entry.identity.clone(),
                remote_addr: entry.connection.remote_addr().map(str::to_string),
                connected_at: entry.connection.connected_at(),
            })
            .collect();
        list.sort_by_key(|info| info.connection_id);
        list
    }

    fn bind(&self, node: &NodeId, connection: &Connection) {
        if let Some(previous) = self.routes.attach(node.clone(), connection.clone()) {
            if previous.id() != connection.id() {
                info!(node_id = %node, previous = %previous.id(), "Direct connection replaced");
            }
        }
        self.publish(Event::NodeConnected(NodeConnectedEvent {
            node_id: node.clone(),
            connection_id: connection.id().as_u64(),
            remote_addr: connection.remote_addr().map(str::to_string),
            timestamp: Utc::now(),
        }));
    }

    fn bind_anonymous(&self, connection_id: ConnectionId, node: &NodeId) -> Result<(), AuthError> {
        let connection = {
            let mut state = self
                .connections
                .get_mut(&connection_id)
                .ok_or(AuthError::UnknownConnection(connection_id))?;
            match &state.identity {
                Some(bound) if bound == node => return Ok(()),
                Some(bound) => {
                    return Err(AuthError::IdentityMismatch {
                        bound: bound.clone(),
                        claimed: node.clone(),
                    })
                }
                None => {}
            }
            state.identity = Some(node.clone());
            state.connection.clone()
        };
        info!(%connection_id, node_id = %node, "Anonymous connection identified");
        self.bind(node, &connection);
        Ok(())
    }

    // ── Inbound ────────────────────────────────────────────

    /// Entry point for every frame read from a connection. Local handlers
    /// run on spawned tasks so the caller's read loop is never held up.
    pub fn handle_frame(self: &Arc<Self>, connection_id: ConnectionId, frame: Frame) {
        let peer = match self.connections.get(&connection_id) {
            Some(state) => state.identity.clone(),
            None => {
                warn!(%connection_id, "Frame on unknown connection");
                self.dropped(Some(connection_id), None, "unknown_connection");
                return;
            }
        };

        let ctx = DecodeContext {
            local: &self.local_id,
            peer: peer.as_ref(),
        };
        let message = match frame::decode(&frame, &ctx) {
            Ok(message) => message,
            Err(e) => {
                warn!(%connection_id, error = %e, "Dropping malformed frame");
                self.dropped(Some(connection_id), None, "malformed");
                return;
            }
        };
        metrics::counter!("mesh_frames_received_total", "kind" => message.kind().as_str())
            .increment(1);

        match message {
            ProtocolMessage::Request(request) => self.on_request(connection_id, peer, request, true),
            ProtocolMessage::Send(request) => self.on_request(connection_id, peer, request, false),
            reply => self.on_reply(connection_id, peer, reply),
        }
    }

    fn on_request(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        peer: Option<NodeId>,
        request: RequestMessage,
        expects_reply: bool,
    ) {
        let header = &request.header;
        if header.has_visited(&self.local_id) {
            warn!(
                %connection_id,
                request_id = %header.request_id,
                path = ?header.network_path,
                "Routing loop detected; dropping"
            );
            self.dropped(Some(connection_id), Some(&header.request_id), "loop");
            return;
        }
        if header.hop_count() >= self.config.max_hops {
            warn!(
                %connection_id,
                request_id = %header.request_id,
                hops = header.hop_count(),
                "Hop limit reached; dropping"
            );
            self.dropped(Some(connection_id), Some(&header.request_id), "max_hops");
            return;
        }

        if header.destination != self.local_id {
            self.forward(connection_id, request, expects_reply);
            return;
        }

        if peer.as_ref() != Some(&header.source) {
            if let Err(e) = self
                .credentials
                .verify(&header.source, header.credential.as_deref())
            {
                warn!(
                    %connection_id,
                    source = %header.source,
                    action = %request.action,
                    error = %e,
                    "Unauthenticated message; dropping"
                );
                self.dropped(Some(connection_id), Some(&header.request_id), "unauthenticated");
                return;
            }
            if peer.is_none() && header.network_path.is_empty() {
                if let Err(e) = self.bind_anonymous(connection_id, &header.source) {
                    warn!(%connection_id, error = %e, "Cannot bind connection identity; dropping");
                    self.dropped(Some(connection_id), Some(&header.request_id), "identity");
                    return;
                }
            }
        }

        let router = Arc::clone(self);
        tokio::spawn(async move {
            let ctx = RequestContext {
                header: request.header.clone(),
                action: request.action.clone(),
                connection: Some(connection_id),
            };
            if expects_reply {
                let mut reply = router.run_request(&ctx, request).await.into_message();
                router.stamp_credential(reply.header_mut());
                router.reply_on(connection_id, reply);
            } else {
                router.run_send(&ctx, request.payload).await;
            }
        });
    }

    fn forward(&self, inbound: ConnectionId, mut request: RequestMessage, expects_reply: bool) {
        let destination = request.header.destination.clone();
        let requester = request.header.source.clone();
        let request_id = request.header.request_id.clone();

        let resolution = self.routes.resolve(&destination);
        let Some(connection) = resolution.connection().cloned() else {
            warn!(%destination, %request_id, action = %request.action, "No route for relayed message; dropping");
            self.dropped(Some(inbound), Some(&request_id), "unreachable");
            return;
        };

        request.header.network_path.push(self.local_id.clone());
        // The requester's own deadline is not on the wire; a reverse path
        // lives for this node's request timeout at most.
        if expects_reply {
            self.forwarded.record(
                requester.clone(),
                request_id.clone(),
                inbound,
                self.config.request_timeout,
            );
        }

        let message = if expects_reply {
            ProtocolMessage::Request(request)
        } else {
            ProtocolMessage::Send(request)
        };
        match connection.send(frame::encode(&message)) {
            Ok(()) => {
                debug!(
                    %destination,
                    %request_id,
                    via = resolution.kind(),
                    next_hop = %connection.id(),
                    "Message forwarded"
                );
                metrics::counter!("mesh_messages_forwarded_total", "via" => resolution.kind())
                    .increment(1);
            }
            Err(e) => {
                if expects_reply {
                    self.forwarded.forget(&requester, &request_id);
                }
                warn!(%destination, %request_id, error = %e, "Forwarding failed; dropping");
                self.dropped(Some(inbound), Some(&request_id), "transport");
            }
        }
    }

    fn on_reply(&self, connection_id: ConnectionId, peer: Option<NodeId>, mut message: ProtocolMessage) {
        let header = message.header();
        let request_id = header.request_id.clone();
        let destination = header.destination.clone();

        if destination == self.local_id {
            let source = header.source.clone();
            if let Err(e) = self.authenticate_reply(peer.as_ref(), header) {
                warn!(%connection_id, %request_id, %source, error = %e, "Unauthenticated reply; dropping");
                self.dropped(Some(connection_id), Some(&request_id), "unauthenticated");
                return;
            }
            let result = match message {
                ProtocolMessage::Response(m) => Ok(m),
                ProtocolMessage::RequestError(m) => Err(RpcError::RequestError(m)),
                ProtocolMessage::ResponseError(m) => Err(RpcError::ResponseError(m)),
                ProtocolMessage::Request(_) | ProtocolMessage::Send(_) => return,
            };
            match self.pending.complete(&request_id, &source, result) {
                Some(done) => {
                    debug!(
                        %request_id,
                        %source,
                        action = %done.action,
                        elapsed_ms = done.elapsed.as_millis() as u64,
                        "Reply matched"
                    );
                    metrics::histogram!("mesh_request_latency_seconds", "action" => done.action)
                        .record(done.elapsed.as_secs_f64());
                }
                None => {
                    warn!(%connection_id, %request_id, %source, "Unmatched reply; dropping");
                    self.dropped(Some(connection_id), Some(&request_id), "unmatched");
                }
            }
            return;
        }

        let Some(inbound) = self.forwarded.take(&destination, &request_id) else {
            warn!(%connection_id, %request_id, %destination, "No reverse path for reply; dropping");
            self.dropped(Some(connection_id), Some(&request_id), "no_reverse_path");
            return;
        };
        message.header_mut().network_path.push(self.local_id.clone());
        debug!(%request_id, %destination, back_to = %inbound, "Relaying reply");
        self.reply_on(inbound, message);
    }

    /// A reply with an empty network path must come from the connection
    /// bound to its source. A relayed reply must carry the source's
    /// credential.
    fn authenticate_reply(&self, peer: Option<&NodeId>, header: &MessageHeader) -> Result<(), AuthError> {
        if header.network_path.is_empty() {
            return match peer {
                Some(bound) if bound == &header.source => Ok(()),
                Some(bound) => Err(AuthError::IdentityMismatch {
                    bound: bound.clone(),
                    claimed: header.source.clone(),
                }),
                None => Err(AuthError::Unidentified(header.source.clone())),
            };
        }
        self.credentials
            .verify(&header.source, header.credential.as_deref())
    }

    fn reply_on(&self, connection_id: ConnectionId, message: ProtocolMessage) {
        let connection = self
            .connections
            .get(&connection_id)
            .map(|state| state.connection.clone());
        let Some(connection) = connection else {
            warn!(%connection_id, request_id = %message.request_id(), "Reply connection is gone; dropping");
            self.dropped(Some(connection_id), Some(message.request_id()), "connection_closed");
            return;
        };
        if let Err(e) = connection.send(frame::encode(&message)) {
            warn!(%connection_id, request_id = %message.request_id(), error = %e, "Reply not delivered");
            self.dropped(Some(connection_id), Some(message.request_id()), "transport");
        }
    }

    // ── Local dispatch ─────────────────────────────────────

    async fn run_request(&self, ctx: &RequestContext, mut request: RequestMessage) -> HandlerOutcome {
        let Some(handler) = self.handlers.get(&request.action) else {
            debug!(action = %request.action, source = %request.header.source, "No handler registered");
            let error = ErrorInfo::not_implemented(&request.action);
            return HandlerOutcome::Rejected(request.error(self.local_id.clone(), error));
        };

        let payload = std::mem::replace(&mut request.payload, Payload::empty());
        match AssertUnwindSafe(handler.handle_request(ctx, payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(payload)) => HandlerOutcome::Response(request.response(self.local_id.clone(), payload)),
            Ok(Err(error)) => {
                debug!(action = %request.action, %error, "Handler returned an error");
                HandlerOutcome::Failed(request.error(self.local_id.clone(), error))
            }
            Err(_) => {
                error!(action = %request.action, request_id = %request.header.request_id, "Handler panicked");
                let error = ErrorInfo::internal(format!("Handler for {} failed", request.action));
                HandlerOutcome::Failed(request.error(self.local_id.clone(), error))
            }
        }
    }

    async fn run_send(&self, ctx: &RequestContext, payload: Payload) {
        let Some(handler) = self.handlers.get(&ctx.action) else {
            debug!(action = %ctx.action, source = %ctx.header.source, "No handler for one-way message; dropping");
            self.dropped(ctx.connection, Some(&ctx.header.request_id), "no_handler");
            return;
        };
        if AssertUnwindSafe(handler.handle_send(ctx, payload))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(action = %ctx.action, request_id = %ctx.header.request_id, "Handler panicked");
        }
    }

    // ── Outbound ───────────────────────────────────────────

    pub async fn send_request(
        &self,
        destination: NodeId,
        action: impl Into<String>,
        payload: Payload,
        options: RequestOptions,
    ) -> Result<ResponseMessage, RpcError> {
        let mut header = MessageHeader::new(self.local_id.clone(), destination);
        let timeout = options.apply(&mut header);
        self.request(RequestMessage::new(header, action, payload), timeout)
            .await
    }

    /// Send a prepared request and wait for its outcome. Requests addressed
    /// to this node run the local handler directly.
    pub async fn request(
        &self,
        mut request: RequestMessage,
        timeout: Option<Duration>,
    ) -> Result<ResponseMessage, RpcError> {
        let after = timeout.unwrap_or(self.config.request_timeout);
        let request_id = request.header.request_id.clone();
        let destination = request.header.destination.clone();
        let action = request.action.clone();
        metrics::counter!("mesh_requests_sent_total", "action" => action.clone()).increment(1);

        let outcome = if destination == self.local_id {
            self.request_local(request, after).await
        } else {
            let resolution = self.routes.resolve(&destination);
            match resolution.connection().cloned() {
                None => {
                    warn!(%destination, %action, %request_id, "Destination unreachable");
                    Err(RpcError::Unreachable(destination))
                }
                Some(connection) => {
                    self.stamp_credential(&mut request.header);
                    debug!(%destination, %action, %request_id, via = resolution.kind(), "Sending request");
                    self.request_remote(connection, request, after).await
                }
            }
        };

        let label = match &outcome {
            Ok(_) => "response",
            Err(e) => e.outcome(),
        };
        metrics::counter!("mesh_request_outcomes_total", "outcome" => label).increment(1);
        outcome
    }

    async fn request_remote(
        &self,
        connection: Connection,
        request: RequestMessage,
        after: Duration,
    ) -> Result<ResponseMessage, RpcError> {
        let request_id = request.header.request_id.clone();
        let Some(mut reply) = self.pending.register(
            request_id.clone(),
            request.header.destination.clone(),
            request.action.clone(),
        ) else {
            return Err(RpcError::DuplicateRequest(request_id));
        };
        let _guard = PendingGuard::new(&self.pending, request_id.clone());

        let message = ProtocolMessage::Request(request);
        if let Err(e) = connection.send(frame::encode(&message)) {
            warn!(%request_id, connection_id = %connection.id(), error = %e, "Transport refused request");
            return Err(e.into());
        }

        match tokio::time::timeout(after, &mut reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Cancelled(request_id)),
            Err(_) => match self.pending.settle_expired(&request_id, &mut reply).await {
                Some(result) => result,
                None => {
                    let action = message.action().unwrap_or_default();
                    Err(self.timed_out(message.header(), action, after))
                }
            },
        }
    }

    async fn request_local(&self, request: RequestMessage, after: Duration) -> Result<ResponseMessage, RpcError> {
        let ctx = RequestContext {
            header: request.header.clone(),
            action: request.action.clone(),
            connection: None,
        };
        match tokio::time::timeout(after, self.run_request(&ctx, request)).await {
            Ok(outcome) => outcome.into_result(),
            Err(_) => Err(self.timed_out(&ctx.header, &ctx.action, after)),
        }
    }

    fn timed_out(&self, header: &MessageHeader, action: &str, after: Duration) -> RpcError {
        warn!(
            request_id = %header.request_id,
            destination = %header.destination,
            action,
            timeout_ms = after.as_millis() as u64,
            "Request timed out"
        );
        self.publish(Event::RequestTimedOut(RequestTimedOutEvent {
            request_id: header.request_id.clone(),
            destination: header.destination.clone(),
            action: action.to_string(),
            event_tracking_id: header.event_tracking_id.clone(),
            timestamp: Utc::now(),
        }));

        let error = ErrorInfo::new(
            ErrorCode::Timeout,
            format!("No reply from {} within {:?}", header.destination, after),
        );
        RpcError::TimedOut {
            message: ErrorMessage {
                header: header.reply(self.local_id.clone()),
                error,
            },
            after,
        }
    }

    /// One-way message. Success means the frame was queued for the next hop.
    pub async fn send_message(
        &self,
        destination: NodeId,
        action: impl Into<String>,
        payload: Payload,
        options: RequestOptions,
    ) -> Result<(), DeliveryError> {
        let mut header = MessageHeader::new(self.local_id.clone(), destination);
        options.apply(&mut header);
        self.deliver(RequestMessage::new(header, action, payload)).await
    }

    pub async fn deliver(&self, mut message: RequestMessage) -> Result<(), DeliveryError> {
        let destination = message.header.destination.clone();
        if destination == self.local_id {
            let ctx = RequestContext {
                header: message.header.clone(),
                action: message.action.clone(),
                connection: None,
            };
            self.run_send(&ctx, message.payload).await;
            return Ok(());
        }

        let resolution = self.routes.resolve(&destination);
        let Some(connection) = resolution.connection().cloned() else {
            warn!(%destination, action = %message.action, "Destination unreachable");
            return Err(DeliveryError::Unreachable(destination));
        };
        self.stamp_credential(&mut message.header);
        connection.send(frame::encode(&ProtocolMessage::Send(message)))?;
        Ok(())
    }

    /// Release the caller waiting on `request_id` with `Cancelled`.
    pub fn cancel_request(&self, request_id: &RequestId) -> bool {
        let cancelled = self
            .pending
            .fail(request_id, RpcError::Cancelled(request_id.clone()))
            .is_some();
        if cancelled {
            info!(%request_id, "Request cancelled");
        }
        cancelled
    }

    // ── Maintenance ────────────────────────────────────────

    /// Drop reverse-path entries whose request deadline has passed.
    pub fn purge_expired(&self) -> usize {
        let purged = self.forwarded.purge_expired();
        if purged > 0 {
            debug!(purged, "Expired reverse-path entries removed");
        }
        purged
    }

    fn stamp_credential(&self, header: &mut MessageHeader) {
        if header.credential.is_none() {
            header.credential = self.credentials.secret_for(&header.destination);
        }
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    fn dropped(&self, connection_id: Option<ConnectionId>, request_id: Option<&RequestId>, reason: &'static str) {
        metrics::counter!("mesh_frames_dropped_total", "reason" => reason).increment(1);
        self.publish(Event::MessageDropped(MessageDroppedEvent {
            connection_id: connection_id.map(ConnectionId::as_u64),
            request_id: request_id.cloned(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }));
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::application::routing::TransportError;
    use crate::notifications::create_event_bus;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn router(local: &str) -> Arc<ProtocolRouter> {
        Arc::new(ProtocolRouter::new(
            RouterConfig::default(),
            Arc::new(RoutingTable::new(node(local))),
            Arc::new(CredentialStore::new()),
        ))
    }

    fn open(router: &ProtocolRouter, peer: Option<&str>) -> (ConnectionId, mpsc::Receiver<Frame>) {
        open_with(router, peer, 16)
    }

    fn open_with(
        router: &ProtocolRouter,
        peer: Option<&str>,
        capacity: usize,
    ) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (connection, rx) = Connection::channel(capacity, None);
        (router.connection_opened(connection, peer.map(node)), rx)
    }

    fn decode(frame: &Frame) -> ProtocolMessage {
        let local = node("OBSERVER");
        frame::decode(frame, &DecodeContext { local: &local, peer: None }).unwrap()
    }

    fn request_frame(request: &RequestMessage) -> Frame {
        frame::encode(&ProtocolMessage::Request(request.clone()))
    }

    fn echo() -> impl MessageHandler {
        FnHandler::new(|_ctx: RequestContext, payload: Payload| async move {
            Ok::<_, ErrorInfo>(payload)
        })
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle_request(&self, _ctx: &RequestContext, _payload: Payload) -> Result<Payload, ErrorInfo> {
            panic!("handler bug")
        }
    }

    #[tokio::test]
    async fn relayed_request_completes_with_response_error() {
        let router = router("CSMS");
        let (hub, mut hub_rx) = open(&router, Some("H"));
        router.routes().add_route(node("D"), node("H")).unwrap();

        let caller = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .send_request(node("D"), "Reset", Payload::empty(), RequestOptions::default())
                    .await
            })
        };

        let ProtocolMessage::Request(sent) = decode(&hub_rx.recv().await.unwrap()) else {
            panic!("expected a request on the hub connection");
        };
        assert_eq!(sent.header.destination, node("D"));
        assert_eq!(sent.action, "Reset");
        assert!(sent.header.network_path.is_empty());

        let mut error = sent.error(node("D"), ErrorInfo::new(ErrorCode::NotSupported, "not here"));
        error.header.network_path.push(node("H"));
        router.handle_frame(hub, frame::encode(&ProtocolMessage::ResponseError(error)));

        match caller.await.unwrap() {
            Err(RpcError::ResponseError(message)) => {
                assert_eq!(message.error.code, ErrorCode::NotSupported);
                assert_eq!(message.header.request_id, sent.header.request_id);
            }
            other => panic!("expected ResponseError, got {other:?}"),
        }
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn hub_forwards_and_returns_reply_on_reverse_path() {
        let hub = router("H");
        let (from_a, mut a_rx) = open(&hub, Some("A"));
        let (from_d, mut d_rx) = open(&hub, Some("D"));
        // A second way to reach A that a fresh lookup would prefer
        let (_other, mut other_rx) = open(&hub, Some("A"));

        let request = RequestMessage::new(
            MessageHeader::new(node("A"), node("D")),
            "Heartbeat",
            Payload::Json(json!({"seq": 7})),
        );
        hub.handle_frame(from_a, request_frame(&request));

        let ProtocolMessage::Request(forwarded) = decode(&d_rx.recv().await.unwrap()) else {
            panic!("expected forwarded request");
        };
        assert_eq!(forwarded.header.network_path, vec![node("H")]);
        assert_eq!(forwarded.header.request_id, request.header.request_id);
        assert_eq!(forwarded.header.source, node("A"));
        assert_eq!(forwarded.payload, request.payload);

        let response = forwarded.response(node("D"), Payload::Json(json!({"ok": true})));
        hub.handle_frame(from_d, frame::encode(&ProtocolMessage::Response(response)));

        let back = decode(&a_rx.recv().await.unwrap());
        assert!(matches!(back, ProtocolMessage::Response(_)));
        assert_eq!(back.request_id(), &request.header.request_id);
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reverse_path_lasts_for_the_hub_request_timeout() {
        let hub = Arc::new(ProtocolRouter::new(
            RouterConfig {
                request_timeout: Duration::from_secs(2),
                ..RouterConfig::default()
            },
            Arc::new(RoutingTable::new(node("H"))),
            Arc::new(CredentialStore::new()),
        ));
        let (from_a, mut a_rx) = open(&hub, Some("A"));
        let (from_d, mut d_rx) = open(&hub, Some("D"));

        let request = RequestMessage::new(
            MessageHeader::new(node("A"), node("D")),
            "Reset",
            Payload::empty(),
        );
        hub.handle_frame(from_a, request_frame(&request));
        let ProtocolMessage::Request(forwarded) = decode(&d_rx.recv().await.unwrap()) else {
            panic!("expected forwarded request");
        };

        tokio::time::advance(Duration::from_secs(3)).await;
        let response = forwarded.response(node("D"), Payload::empty());
        hub.handle_frame(from_d, frame::encode(&ProtocolMessage::Response(response)));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_is_reported_at_send_time() {
        let router = router("CSMS");
        let started = tokio::time::Instant::now();
        let result = router
            .send_request(
                node("NOWHERE"),
                "Reset",
                Payload::empty(),
                RequestOptions::with_timeout(Duration::from_secs(2)),
            )
            .await;

        assert!(matches!(result, Err(RpcError::Unreachable(ref n)) if n == &node("NOWHERE")));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_destination_times_out_and_late_reply_is_dropped() {
        let bus = create_event_bus();
        let mut events = bus.subscribe();
        let router = Arc::new(
            ProtocolRouter::new(
                RouterConfig::default(),
                Arc::new(RoutingTable::new(node("CSMS"))),
                Arc::new(CredentialStore::new()),
            )
            .with_event_bus(bus.clone()),
        );
        let (conn, mut rx) = open(&router, Some("D"));

        let result = router
            .send_request(
                node("D"),
                "Reset",
                Payload::empty(),
                RequestOptions::with_timeout(Duration::from_secs(2)),
            )
            .await;
        let Err(RpcError::TimedOut { message, after }) = result else {
            panic!("expected timeout");
        };
        assert_eq!(after, Duration::from_secs(2));
        assert_eq!(message.error.code, ErrorCode::Timeout);
        assert_eq!(router.pending_count(), 0);

        let ProtocolMessage::Request(sent) = decode(&rx.recv().await.unwrap()) else {
            panic!("expected request");
        };
        assert_eq!(sent.header.request_id, message.header.request_id);

        let late = sent.response(node("D"), Payload::empty());
        router.handle_frame(conn, frame::encode(&ProtocolMessage::Response(late)));
        assert_eq!(router.pending_count(), 0);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(events.recv().await.unwrap().event.event_type());
        }
        assert_eq!(seen, vec!["node_connected", "request_timed_out", "message_dropped"]);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_connection_does_not_fail_pending_request_early() {
        let router = router("CSMS");
        let (conn, mut rx) = open(&router, Some("D"));

        let caller = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .send_request(
                        node("D"),
                        "Reset",
                        Payload::empty(),
                        RequestOptions::with_timeout(Duration::from_secs(5)),
                    )
                    .await
            })
        };
        rx.recv().await.unwrap();
        router.connection_closed(conn);
        assert!(router.routes().direct(&node("D")).is_none());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!caller.is_finished());
        assert_eq!(router.pending_count(), 1);

        assert!(matches!(caller.await.unwrap(), Err(RpcError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn response_completes_pending_request() {
        let router = router("CSMS");
        let (conn, mut rx) = open(&router, Some("D"));

        let caller = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .send_request(node("D"), "Heartbeat", Payload::empty(), RequestOptions::default())
                    .await
            })
        };
        let ProtocolMessage::Request(sent) = decode(&rx.recv().await.unwrap()) else {
            panic!("expected request");
        };
        let reply = sent.response(node("D"), Payload::Json(json!({"currentTime": "now"})));
        router.handle_frame(conn, frame::encode(&ProtocolMessage::Response(reply)));

        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.payload, Payload::Json(json!({"currentTime": "now"})));
        assert_eq!(response.header.event_tracking_id, sent.header.event_tracking_id);
    }

    #[tokio::test]
    async fn forged_replies_do_not_complete_requests() {
        let bus = create_event_bus();
        let mut events = bus.subscribe();
        let router = Arc::new(
            ProtocolRouter::new(
                RouterConfig::default(),
                Arc::new(RoutingTable::new(node("CSMS"))),
                Arc::new(CredentialStore::new()),
            )
            .with_event_bus(bus.clone()),
        );
        router.credentials().set(node("D"), "d-secret");
        let (d_conn, mut d_rx) = open(&router, Some("D"));
        let (m_conn, _m_rx) = open(&router, Some("M"));

        let caller = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .send_request(node("D"), "Reset", Payload::empty(), RequestOptions::default())
                    .await
            })
        };
        let ProtocolMessage::Request(sent) = decode(&d_rx.recv().await.unwrap()) else {
            panic!("expected request");
        };

        let direct = sent.response(node("D"), Payload::Json(json!({"forged": 1})));
        router.handle_frame(m_conn, frame::encode(&ProtocolMessage::Response(direct)));
        let mut relayed = sent.response(node("D"), Payload::Json(json!({"forged": 2})));
        relayed.header.network_path.push(node("M"));
        router.handle_frame(m_conn, frame::encode(&ProtocolMessage::Response(relayed)));
        tokio::task::yield_now().await;
        assert!(!caller.is_finished());
        assert_eq!(router.pending_count(), 1);

        let genuine = sent.response(node("D"), Payload::Json(json!({"ok": true})));
        router.handle_frame(d_conn, frame::encode(&ProtocolMessage::Response(genuine)));
        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.payload, Payload::Json(json!({"ok": true})));

        let mut reasons = Vec::new();
        for _ in 0..4 {
            if let Event::MessageDropped(e) = events.recv().await.unwrap().event {
                reasons.push(e.reason);
            }
        }
        assert_eq!(reasons, vec!["unauthenticated", "unauthenticated"]);
    }

    #[tokio::test]
    async fn replies_carry_requester_credential() {
        let router = router("CSMS");
        router.register_handler("Echo", echo());
        router.credentials().set(node("A"), "a-secret");
        let (conn, mut rx) = open(&router, Some("A"));

        let request = RequestMessage::new(
            MessageHeader::new(node("A"), node("CSMS")),
            "Echo",
            Payload::empty(),
        );
        router.handle_frame(conn, request_frame(&request));
        let reply = decode(&rx.recv().await.unwrap());
        assert_eq!(reply.header().credential.as_deref(), Some("a-secret"));
    }

    #[tokio::test]
    async fn local_requests_are_answered_on_inbound_connection() {
        let router = router("CSMS");
        router.register_handler("Echo", echo());
        let (conn, mut rx) = open(&router, Some("A"));

        let request = RequestMessage::new(
            MessageHeader::new(node("A"), node("CSMS")),
            "Echo",
            Payload::Json(json!({"n": 1})),
        );
        router.handle_frame(conn, request_frame(&request));

        let ProtocolMessage::Response(response) = decode(&rx.recv().await.unwrap()) else {
            panic!("expected response");
        };
        assert_eq!(response.payload, request.payload);
        assert_eq!(response.header.request_id, request.header.request_id);
        assert_eq!(response.header.event_tracking_id, request.header.event_tracking_id);
        assert_eq!(response.header.destination, node("A"));
    }

    #[tokio::test]
    async fn unknown_action_is_rejected_as_not_implemented() {
        let router = router("CSMS");
        let (conn, mut rx) = open(&router, Some("A"));

        let request = RequestMessage::new(
            MessageHeader::new(node("A"), node("CSMS")),
            "FirmwareUpdate",
            Payload::empty(),
        );
        router.handle_frame(conn, request_frame(&request));

        match decode(&rx.recv().await.unwrap()) {
            ProtocolMessage::RequestError(error) => {
                assert_eq!(error.error.code, ErrorCode::NotImplemented);
            }
            other => panic!("expected RequestError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal_error() {
        let router = router("CSMS");
        router.register_handler("Boom", Panicking);
        let (conn, mut rx) = open(&router, Some("A"));

        let request = RequestMessage::new(
            MessageHeader::new(node("A"), node("CSMS")),
            "Boom",
            Payload::empty(),
        );
        router.handle_frame(conn, request_frame(&request));

        match decode(&rx.recv().await.unwrap()) {
            ProtocolMessage::ResponseError(error) => {
                assert_eq!(error.error.code, ErrorCode::InternalError);
            }
            other => panic!("expected ResponseError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_destination_skips_the_network() {
        let router = router("CSMS");
        router.register_handler("Echo", echo());

        let response = router
            .send_request(
                node("CSMS"),
                "Echo",
                Payload::Json(json!({"x": 1})),
                RequestOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.payload, Payload::Json(json!({"x": 1})));

        let missing = router
            .send_request(node("CSMS"), "Missing", Payload::empty(), RequestOptions::default())
            .await;
        assert!(matches!(missing, Err(RpcError::RequestError(_))));
    }

    #[tokio::test]
    async fn full_queue_is_a_transport_error() {
        let router = router("CSMS");
        let (_conn, _rx) = open_with(&router, Some("D"), 1);
        router
            .send_message(node("D"), "StatusNotification", Payload::empty(), RequestOptions::default())
            .await
            .unwrap();

        let result = router
            .send_request(node("D"), "Reset", Payload::empty(), RequestOptions::default())
            .await;
        assert!(matches!(result, Err(RpcError::Transport(TransportError::QueueFull))));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_releases_waiting_caller() {
        let router = router("CSMS");
        let (_conn, mut rx) = open(&router, Some("D"));

        let caller = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .send_request(node("D"), "Reset", Payload::empty(), RequestOptions::default())
                    .await
            })
        };
        let sent = decode(&rx.recv().await.unwrap());
        assert!(router.cancel_request(sent.request_id()));
        assert!(!router.cancel_request(sent.request_id()));

        assert!(matches!(caller.await.unwrap(), Err(RpcError::Cancelled(_))));
    }

    #[tokio::test]
    async fn one_way_messages_reach_handler_without_reply() {
        let router = router("CSMS");
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        router.register_handler(
            "StatusNotification",
            FnHandler::new(move |ctx: RequestContext, _payload: Payload| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(ctx.header.source.clone());
                    Ok::<_, ErrorInfo>(Payload::empty())
                }
            }),
        );
        let (conn, mut rx) = open(&router, Some("ST-1"));

        let send = RequestMessage::new(
            MessageHeader::new(node("ST-1"), node("CSMS")),
            "StatusNotification",
            Payload::empty(),
        );
        router.handle_frame(conn, frame::encode(&ProtocolMessage::Send(send)));

        assert_eq!(seen_rx.recv().await, Some(node("ST-1")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn anonymous_connection_must_authenticate_and_is_then_bound() {
        let router = router("CSMS");
        router.register_handler("Echo", echo());
        router.credentials().set(node("A"), "s3cret");
        let (conn, mut rx) = open(&router, None);

        let unauthenticated = RequestMessage::new(
            MessageHeader::new(node("A"), node("CSMS")),
            "Echo",
            Payload::empty(),
        );
        router.handle_frame(conn, request_frame(&unauthenticated));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(router.connection_identity(conn), None);

        let mut header = MessageHeader::new(node("A"), node("CSMS"));
        header.credential = Some("s3cret".into());
        let authenticated = RequestMessage::new(header, "Echo", Payload::empty());
        router.handle_frame(conn, request_frame(&authenticated));

        assert!(matches!(decode(&rx.recv().await.unwrap()), ProtocolMessage::Response(_)));
        assert_eq!(router.connection_identity(conn), Some(node("A")));
        assert_eq!(router.routes().direct(&node("A")).map(|c| c.id()), Some(conn));
    }

    #[tokio::test]
    async fn claimed_source_other_than_peer_is_verified() {
        let router = router("CSMS");
        router.register_handler("Echo", echo());
        router.credentials().set(node("X"), "x-secret");
        let (conn, mut rx) = open(&router, Some("H"));

        let mut header = MessageHeader::new(node("X"), node("CSMS"));
        header.network_path.push(node("H"));
        header.credential = Some("wrong".into());
        router.handle_frame(conn, request_frame(&RequestMessage::new(header, "Echo", Payload::empty())));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        let mut header = MessageHeader::new(node("X"), node("CSMS"));
        header.network_path.push(node("H"));
        header.credential = Some("x-secret".into());
        router.handle_frame(conn, request_frame(&RequestMessage::new(header, "Echo", Payload::empty())));
        assert!(matches!(decode(&rx.recv().await.unwrap()), ProtocolMessage::Response(_)));
        // Relayed traffic never rebinds the connection
        assert_eq!(router.connection_identity(conn), Some(node("H")));
    }

    #[tokio::test]
    async fn outbound_requests_carry_destination_credential() {
        let router = router("CSMS");
        router.credentials().set(node("D"), "d-secret");
        let (_conn, mut rx) = open(&router, Some("D"));

        router
            .send_message(node("D"), "DataTransfer", Payload::empty(), RequestOptions::default())
            .await
            .unwrap();
        let sent = decode(&rx.recv().await.unwrap());
        assert_eq!(sent.header().credential.as_deref(), Some("d-secret"));
    }

    #[tokio::test]
    async fn loops_and_hop_limit_are_dropped() {
        let router = router("H");
        let (from_a, _a_rx) = open(&router, Some("A"));
        let (_to_d, mut d_rx) = open(&router, Some("D"));

        let mut looped = MessageHeader::new(node("A"), node("D"));
        looped.network_path = vec![node("H"), node("B")];
        router.handle_frame(from_a, request_frame(&RequestMessage::new(looped, "Echo", Payload::empty())));

        let mut too_far = MessageHeader::new(node("A"), node("D"));
        too_far.network_path = (0..DEFAULT_MAX_HOPS).map(|i| node(&format!("N{i}"))).collect();
        router.handle_frame(from_a, request_frame(&RequestMessage::new(too_far, "Echo", Payload::empty())));

        assert!(d_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_connection_stays_usable() {
        let router = router("CSMS");
        router.register_handler("Echo", echo());
        let (conn, mut rx) = open(&router, Some("A"));

        router.handle_frame(conn, Frame::Text("not json".into()));
        router.handle_frame(conn, Frame::Text("[9, \"x\"]".into()));

        router.handle_frame(conn, Frame::Text(r#"[2, "r-1", "Echo", {}]"#.into()));
        match decode(&rx.recv().await.unwrap()) {
            ProtocolMessage::Response(response) => {
                assert_eq!(response.header.request_id, RequestId::from("r-1"));
                assert_eq!(response.header.destination, node("A"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn connection_table_tracks_identity() {
        let router = router("CSMS");
        let (a, _rx_a) = open(&router, Some("A"));
        let (anon, _rx_anon) = open(&router, None);

        let list = router.connections();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].connection_id, a);
        assert_eq!(list[0].node_id, Some(node("A")));
        assert_eq!(list[1].connection_id, anon);
        assert_eq!(list[1].node_id, None);

        router.connection_closed(a);
        assert!(router.routes().direct(&node("A")).is_none());
        assert_eq!(router.connections().len(), 1);
    }
}
