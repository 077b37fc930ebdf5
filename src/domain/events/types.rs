//! Notification events
//!
//! Defines all event types that can be broadcasted to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::asset::AssetLevel;
use crate::domain::ids::{AssetId, EventTrackingId, NodeId, RequestId};
use crate::domain::status::Timestamped;

/// Event types for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    NodeConnected(NodeConnectedEvent),
    NodeDisconnected(NodeDisconnectedEvent),
    ChildAdded(ChildChangedEvent),
    ChildRemoved(ChildChangedEvent),
    PropertyChanged(PropertyChangedEvent),
    StatusChanged(StatusChangedEvent),
    RequestTimedOut(RequestTimedOutEvent),
    MessageDropped(MessageDroppedEvent),
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::NodeConnected(_) => "node_connected",
            Event::NodeDisconnected(_) => "node_disconnected",
            Event::ChildAdded(_) => "child_added",
            Event::ChildRemoved(_) => "child_removed",
            Event::PropertyChanged(_) => "property_changed",
            Event::StatusChanged(_) => "status_changed",
            Event::RequestTimedOut(_) => "request_timed_out",
            Event::MessageDropped(_) => "message_dropped",
        }
    }

    /// Networking participant the event is about, if any.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Event::NodeConnected(e) => Some(&e.node_id),
            Event::NodeDisconnected(e) => e.node_id.as_ref(),
            Event::RequestTimedOut(e) => Some(&e.destination),
            _ => None,
        }
    }

    /// Asset the event is about, if any.
    pub fn asset_id(&self) -> Option<&AssetId> {
        match self {
            Event::ChildAdded(e) | Event::ChildRemoved(e) => Some(&e.child),
            Event::PropertyChanged(e) => Some(&e.entity),
            Event::StatusChanged(e) => Some(&e.entity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConnectedEvent {
    pub node_id: NodeId,
    pub connection_id: u64,
    pub remote_addr: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDisconnectedEvent {
    pub node_id: Option<NodeId>,
    pub connection_id: u64,
    pub timestamp: DateTime<Utc>,
}

/// A child was added to or removed from a parent asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildChangedEvent {
    pub timestamp: DateTime<Utc>,
    pub parent: AssetId,
    pub parent_level: AssetLevel,
    pub child: AssetId,
    /// Outcome of the add vote; `None` for removals, which are not voted on.
    pub approved: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyChangedEvent {
    pub timestamp: DateTime<Utc>,
    pub entity: AssetId,
    pub level: AssetLevel,
    pub property: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangedEvent {
    pub timestamp: DateTime<Utc>,
    pub entity: AssetId,
    pub level: AssetLevel,
    pub old: Timestamped<String>,
    pub new: Timestamped<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTimedOutEvent {
    pub request_id: RequestId,
    pub destination: NodeId,
    pub action: String,
    pub event_tracking_id: EventTrackingId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDroppedEvent {
    pub connection_id: Option<u64>,
    pub request_id: Option<RequestId>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Envelope for events sent over the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventMessage {
    pub fn new(event: Event) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        }
    }
}
