//! WebSocket handler for notification clients
//!
//! Streams event bus traffic (connections, asset changes, timeouts, drops)
//! to operators and dashboards.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::domain::events::EventMessage;
use crate::notifications::SharedEventBus;

/// Query parameters for filtering events
#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    /// Only events about this networking node
    pub node_id: Option<String>,
    /// Only events about this asset
    pub asset_id: Option<String>,
    /// Filter by event types (comma-separated, optional)
    pub event_types: Option<String>,
}

impl EventFilter {
    /// Check if event matches the filter
    pub fn matches(&self, event: &EventMessage) -> bool {
        if let Some(ref wanted) = self.node_id {
            match event.event.node_id() {
                Some(node) if node.as_str() == wanted => {}
                _ => return false,
            }
        }

        if let Some(ref wanted) = self.asset_id {
            match event.event.asset_id() {
                Some(asset) if asset.as_str() == wanted => {}
                _ => return false,
            }
        }

        if let Some(ref types) = self.event_types {
            let allowed_types: Vec<&str> = types.split(',').map(|s| s.trim()).collect();
            if !allowed_types.contains(&event.event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// State for notification WebSocket handler
#[derive(Clone)]
pub struct NotificationState {
    pub event_bus: SharedEventBus,
}

/// WebSocket upgrade handler for notifications
pub async fn ws_notifications_handler(
    ws: WebSocketUpgrade,
    State(state): State<NotificationState>,
    Query(filter): Query<EventFilter>,
) -> impl IntoResponse {
    info!(
        node_id = ?filter.node_id,
        asset_id = ?filter.asset_id,
        event_types = ?filter.event_types,
        "New notification WebSocket connection"
    );

    ws.on_upgrade(move |socket| handle_notification_socket(socket, state, filter))
}

/// Handle a WebSocket connection for notifications
async fn handle_notification_socket(
    socket: WebSocket,
    state: NotificationState,
    filter: EventFilter,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscriber = state.event_bus.subscribe();

    // Send welcome message
    let welcome = serde_json::json!({
        "type": "connected",
        "message": "Connected to notification stream",
        "filter": {
            "node_id": filter.node_id,
            "asset_id": filter.asset_id,
            "event_types": filter.event_types
        }
    });

    if let Err(e) = sender
        .send(Message::Text(welcome.to_string().into()))
        .await
    {
        error!("Failed to send welcome message: {}", e);
        return;
    }

    info!("Notification WebSocket client connected");

    loop {
        select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received text message: {}", text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("Received pong");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client sent close");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                    _ => {}
                }
            }

            event = subscriber.recv() => {
                match event {
                    Some(event_msg) => {
                        if !filter.matches(&event_msg) {
                            continue;
                        }

                        match serde_json::to_string(&event_msg) {
                            Ok(json) => {
                                if let Err(e) = sender.send(Message::Text(json.into())).await {
                                    error!("Failed to send event: {}", e);
                                    break;
                                }
                                debug!("Event sent to client: {}", event_msg.event.event_type());
                            }
                            Err(e) => {
                                error!("Failed to serialize event: {}", e);
                            }
                        }
                    }
                    None => {
                        warn!("Event bus closed");
                        break;
                    }
                }
            }
        }
    }

    info!("Notification WebSocket client disconnected");
}

/// Create notification state
pub fn create_notification_state(event_bus: SharedEventBus) -> NotificationState {
    NotificationState { event_bus }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::domain::asset::AssetLevel;
    use crate::domain::events::{Event, NodeConnectedEvent, StatusChangedEvent};
    use crate::domain::ids::{AssetId, NodeId};
    use crate::domain::status::Timestamped;

    fn connected(node: &str) -> EventMessage {
        EventMessage::new(Event::NodeConnected(NodeConnectedEvent {
            node_id: NodeId::new(node).unwrap(),
            connection_id: 1,
            remote_addr: None,
            timestamp: Utc::now(),
        }))
    }

    fn status(asset: &str) -> EventMessage {
        let now = Utc::now();
        EventMessage::new(Event::StatusChanged(StatusChangedEvent {
            timestamp: now,
            entity: AssetId::new(asset).unwrap(),
            level: AssetLevel::Socket,
            old: Timestamped::new(now, "Unknown".into()),
            new: Timestamped::new(now, "Available".into()),
        }))
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = EventFilter::default();
        assert!(filter.matches(&connected("ST-1")));
        assert!(filter.matches(&status("ST-1-1")));
    }

    #[test]
    fn filters_by_node_asset_and_type() {
        let by_node = EventFilter {
            node_id: Some("ST-1".into()),
            ..Default::default()
        };
        assert!(by_node.matches(&connected("ST-1")));
        assert!(!by_node.matches(&connected("ST-2")));
        assert!(!by_node.matches(&status("ST-1")));

        let by_asset = EventFilter {
            asset_id: Some("ST-1-1".into()),
            ..Default::default()
        };
        assert!(by_asset.matches(&status("ST-1-1")));
        assert!(!by_asset.matches(&connected("ST-1-1")));

        let by_type = EventFilter {
            event_types: Some("status_changed, child_added".into()),
            ..Default::default()
        };
        assert!(by_type.matches(&status("X")));
        assert!(!by_type.matches(&connected("X")));
    }
}
