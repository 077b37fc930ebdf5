//! Payloads delivered by asset notificators

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::kind::AssetKind;
use super::node::{AssetNode, ChildNode};
use crate::domain::events::{ChildChangedEvent, Event, PropertyChangedEvent, StatusChangedEvent};
use crate::domain::ids::AssetId;
use crate::domain::status::Timestamped;

/// An asset's own status moved from `old` to `new`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange<S> {
    pub timestamp: DateTime<Utc>,
    pub entity: AssetId,
    pub old: Timestamped<S>,
    pub new: Timestamped<S>,
}

/// One of a parent's direct children changed status.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildStatusChange<S> {
    pub timestamp: DateTime<Utc>,
    pub parent: AssetId,
    pub child: AssetId,
    pub old: Timestamped<S>,
    pub new: Timestamped<S>,
}

/// Proposed or applied structural change under `parent`.
pub struct ChildChange<K: AssetKind> {
    pub timestamp: DateTime<Utc>,
    pub parent: Arc<AssetNode<K>>,
    pub child: Arc<K::Child>,
}

impl<K: AssetKind> ChildChange<K> {
    pub fn parent_id(&self) -> &AssetId {
        self.parent.id()
    }

    pub fn child_id(&self) -> &AssetId {
        self.child.id()
    }
}

/// Level-erased asset event, re-emitted upward through the hierarchy so a
/// single subscription on a pool sees everything below it.
#[derive(Debug, Clone)]
pub enum AssetEvent {
    ChildAdded(ChildChangedEvent),
    ChildRemoved(ChildChangedEvent),
    PropertyChanged(PropertyChangedEvent),
    StatusChanged(StatusChangedEvent),
}

impl AssetEvent {
    pub fn entity(&self) -> &AssetId {
        match self {
            Self::ChildAdded(e) | Self::ChildRemoved(e) => &e.child,
            Self::PropertyChanged(e) => &e.entity,
            Self::StatusChanged(e) => &e.entity,
        }
    }
}

impl From<AssetEvent> for Event {
    fn from(event: AssetEvent) -> Self {
        match event {
            AssetEvent::ChildAdded(e) => Event::ChildAdded(e),
            AssetEvent::ChildRemoved(e) => Event::ChildRemoved(e),
            AssetEvent::PropertyChanged(e) => Event::PropertyChanged(e),
            AssetEvent::StatusChanged(e) => Event::StatusChanged(e),
        }
    }
}
