//! Asset node
//!
//! One generic node type serves all three hierarchy levels. A node owns its
//! children, keeps a bounded status history, resolves attributes through its
//! parent, and exposes notificators for structural, attribute and status
//! changes.
//!
//! Structural changes on one parent are serialized by a per-node lock so the
//! duplicate check, the vote and the insertion happen atomically with respect
//! to each other. Status recomputation is serialized by the history lock.
//! Observers always run after every internal lock has been released, except
//! for the structure lock, which is held while add/remove observers fire so
//! they see the change they are told about.
//!
//! Parents reach their children through [`ChildNode`]. Sockets use
//! [`NoChildren`] as their child type, which has no values.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::aggregation::{Aggregator, StatusSnapshot};
use super::attributes::{AttributeChange, AttributeSource, AttributeStore};
use super::events::{AssetEvent, ChildChange, ChildStatusChange, StatusChange};
use super::kind::{AssetKind, AssetLevel, StatusValue};
use crate::domain::error::{AssetError, AssetResult};
use crate::domain::events::{ChildChangedEvent, PropertyChangedEvent, StatusChangedEvent};
use crate::domain::ids::AssetId;
use crate::domain::status::{SocketStatus, StatusHistory, Timestamped, DEFAULT_HISTORY_CAPACITY};
use crate::notifications::veto::{HandlerId, Observers, Verdict, VetoNotificator};

/// Status type of a kind's children.
pub type ChildStatusOf<K> = <<K as AssetKind>::Child as ChildNode>::Status;

/// Error a child configuration callback may return.
pub type ConfigureError = Box<dyn std::error::Error + Send + Sync>;

/// What a parent needs from the nodes it contains.
pub trait ChildNode: AttributeSource + Sized + 'static {
    type Status: StatusValue;

    /// Unpublished child of `parent_id`; `None` for a type without values.
    fn detached(
        id: AssetId,
        parent_id: AssetId,
        parent: Weak<dyn AttributeSource>,
        history_capacity: usize,
    ) -> Option<Self>;

    fn id(&self) -> &AssetId;

    fn status(&self) -> Timestamped<Self::Status>;

    fn status_observers(&self) -> &Observers<StatusChange<Self::Status>>;

    fn event_observers(&self) -> &Observers<AssetEvent>;

    /// Stop resolving attributes through the former parent.
    fn unlink(&self);
}

/// Child type of the leaf level.
#[derive(Debug)]
pub enum NoChildren {}

impl AttributeSource for NoChildren {
    fn attribute(&self, _name: &str) -> Option<Value> {
        match *self {}
    }
}

impl ChildNode for NoChildren {
    type Status = SocketStatus;

    fn detached(_: AssetId, _: AssetId, _: Weak<dyn AttributeSource>, _: usize) -> Option<Self> {
        None
    }

    fn id(&self) -> &AssetId {
        match *self {}
    }

    fn status(&self) -> Timestamped<SocketStatus> {
        match *self {}
    }

    fn status_observers(&self) -> &Observers<StatusChange<SocketStatus>> {
        match *self {}
    }

    fn event_observers(&self) -> &Observers<AssetEvent> {
        match *self {}
    }

    fn unlink(&self) {
        match *self {}
    }
}

/// Outcome of a successful add request.
pub enum ChildOutcome<C: ChildNode> {
    Added(Arc<C>),
    Vetoed { reason: String },
}

impl<C: ChildNode> ChildOutcome<C> {
    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added(_))
    }

    pub fn added(self) -> Option<Arc<C>> {
        match self {
            Self::Added(child) => Some(child),
            Self::Vetoed { .. } => None,
        }
    }
}

impl<C: ChildNode> std::fmt::Debug for ChildOutcome<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added(child) => f.debug_tuple("Added").field(child.id()).finish(),
            Self::Vetoed { reason } => f.debug_struct("Vetoed").field("reason", reason).finish(),
        }
    }
}

struct ChildSlot<C: ChildNode> {
    node: Arc<C>,
    status_subscription: HandlerId,
    event_subscription: HandlerId,
}

pub struct AssetNode<K: AssetKind> {
    id: AssetId,
    parent_id: Option<AssetId>,
    attributes: AttributeStore,
    history: Mutex<StatusHistory<K::Status>>,
    children: DashMap<AssetId, ChildSlot<K::Child>>,
    aggregator: RwLock<Option<Aggregator<ChildStatusOf<K>, K::Status>>>,
    structure: Mutex<()>,
    child_added: VetoNotificator<ChildChange<K>>,
    child_removed: Observers<ChildChange<K>>,
    status_changed: Observers<StatusChange<K::Status>>,
    child_status_changed: Observers<ChildStatusChange<ChildStatusOf<K>>>,
    events: Observers<AssetEvent>,
}

impl<K: AssetKind> AssetNode<K> {
    /// Top-level asset without a parent.
    pub fn new_root(id: AssetId, history_capacity: usize) -> Arc<Self> {
        Arc::new(Self::build(id, None, None, history_capacity))
    }

    fn build(
        id: AssetId,
        parent_id: Option<AssetId>,
        parent: Option<Weak<dyn AttributeSource>>,
        history_capacity: usize,
    ) -> Self {
        Self {
            id,
            parent_id,
            attributes: AttributeStore::new(parent),
            history: Mutex::new(StatusHistory::unknown(history_capacity)),
            children: DashMap::new(),
            aggregator: RwLock::new(None),
            structure: Mutex::new(()),
            child_added: VetoNotificator::new("child_added"),
            child_removed: Observers::new("child_removed"),
            status_changed: Observers::new("status_changed"),
            child_status_changed: Observers::new("child_status_changed"),
            events: Observers::new("asset_events"),
        }
    }

    pub fn id(&self) -> &AssetId {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&AssetId> {
        self.parent_id.as_ref()
    }

    pub fn level(&self) -> AssetLevel {
        K::LEVEL
    }

    // ── Notificators ───────────────────────────────────────────

    /// Voters decide whether a proposed child may be added; observers hear
    /// about children that were.
    ///
    /// Voters and observers run while this node's structure lock is held.
    /// They must not add or remove children of this same node; doing so
    /// deadlocks. Changing the proposed child or any other node is fine.
    pub fn on_child_added(&self) -> &VetoNotificator<ChildChange<K>> {
        &self.child_added
    }

    /// Removals are not voted on. Observers run under the same structure
    /// lock as [`on_child_added`](Self::on_child_added) and share its
    /// restriction.
    pub fn on_child_removed(&self) -> &Observers<ChildChange<K>> {
        &self.child_removed
    }

    pub fn on_status_changed(&self) -> &Observers<StatusChange<K::Status>> {
        &self.status_changed
    }

    pub fn on_child_status_changed(&self) -> &Observers<ChildStatusChange<ChildStatusOf<K>>> {
        &self.child_status_changed
    }

    /// Every event of this asset and of all its descendants.
    pub fn on_event(&self) -> &Observers<AssetEvent> {
        &self.events
    }

    // ── Attributes ─────────────────────────────────────────────

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes.get(name)
    }

    pub fn attribute_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.attributes.get_as(name)
    }

    pub fn local_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.get_local(name)
    }

    pub fn local_attribute_names(&self) -> Vec<String> {
        self.attributes.local_names()
    }

    /// Returns `false` when the local value was already equal.
    pub fn set_attribute(&self, name: &str, value: impl Into<Value>) -> bool {
        match self.attributes.set(name, value.into()) {
            Some(change) => {
                self.emit_property_changed(change);
                true
            }
            None => false,
        }
    }

    /// Drop a local override; returns `false` if there was none.
    pub fn clear_attribute(&self, name: &str) -> bool {
        match self.attributes.clear(name) {
            Some(change) => {
                self.emit_property_changed(change);
                true
            }
            None => false,
        }
    }

    fn emit_property_changed(&self, change: AttributeChange) {
        debug!(asset = %self.id, property = %change.property, "Attribute changed");
        self.events
            .notify(&AssetEvent::PropertyChanged(PropertyChangedEvent {
                timestamp: Utc::now(),
                entity: self.id.clone(),
                level: K::LEVEL,
                property: change.property,
                old: change.old,
                new: change.new,
            }));
    }

    // ── Status ─────────────────────────────────────────────────

    pub fn status(&self) -> Timestamped<K::Status> {
        self.lock_history().current().clone()
    }

    /// Newest first.
    pub fn status_history(&self) -> Vec<Timestamped<K::Status>> {
        self.lock_history().to_vec()
    }

    pub fn history_capacity(&self) -> usize {
        self.lock_history().capacity()
    }

    /// Record a status reported for this asset. Nothing is recorded or
    /// emitted when the value equals the current one.
    pub fn set_status(&self, timestamp: DateTime<Utc>, value: K::Status) -> bool {
        let change = {
            let mut history = self.lock_history();
            match self.push_if_changed(&mut history, timestamp, value) {
                Some(change) => change,
                None => return false,
            }
        };
        self.fire_status_changed(change);
        true
    }

    /// Install the function deriving this asset's status from its children
    /// and apply it immediately.
    pub fn set_aggregator<F>(&self, aggregator: F)
    where
        F: Fn(&StatusSnapshot<ChildStatusOf<K>>) -> K::Status + Send + Sync + 'static,
    {
        *self.aggregator.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(aggregator));
        self.recompute_status(Utc::now());
    }

    pub fn clear_aggregator(&self) {
        *self.aggregator.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn has_aggregator(&self) -> bool {
        self.aggregator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// A direct child changed status. Always fires `child_status_changed`;
    /// then re-derives this asset's own status if an aggregator is set.
    pub fn update_child_status(&self, change: &StatusChange<ChildStatusOf<K>>) {
        self.child_status_changed.notify(&ChildStatusChange {
            timestamp: change.timestamp,
            parent: self.id.clone(),
            child: change.entity.clone(),
            old: change.old.clone(),
            new: change.new.clone(),
        });
        self.recompute_status(change.timestamp);
    }

    /// Re-run the aggregator over the children's current statuses. Returns
    /// whether the status changed.
    pub fn recompute_status(&self, timestamp: DateTime<Utc>) -> bool {
        let Some(aggregator) = self
            .aggregator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return false;
        };

        let change = {
            let mut history = self.lock_history();
            let snapshot = self.child_snapshot(timestamp);
            let value = match catch_unwind(AssertUnwindSafe(|| aggregator(&snapshot))) {
                Ok(value) => value,
                Err(_) => {
                    error!(asset = %self.id, "Status aggregator panicked; status left unchanged");
                    return false;
                }
            };
            match self.push_if_changed(&mut history, timestamp, value) {
                Some(change) => change,
                None => return false,
            }
        };
        self.fire_status_changed(change);
        true
    }

    /// Current status of every direct child, sorted by id.
    pub fn child_snapshot(&self, timestamp: DateTime<Utc>) -> StatusSnapshot<ChildStatusOf<K>> {
        let mut children: Vec<_> = self
            .children
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().node.status()))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        StatusSnapshot { timestamp, children }
    }

    fn push_if_changed(
        &self,
        history: &mut StatusHistory<K::Status>,
        timestamp: DateTime<Utc>,
        value: K::Status,
    ) -> Option<StatusChange<K::Status>> {
        if history.current().value == value {
            return None;
        }
        let old = history.current().clone();
        history.push(timestamp, value);
        Some(StatusChange {
            timestamp,
            entity: self.id.clone(),
            old,
            new: history.current().clone(),
        })
    }

    fn fire_status_changed(&self, change: StatusChange<K::Status>) {
        info!(
            asset = %self.id,
            level = %K::LEVEL,
            old = %change.old.value,
            new = %change.new.value,
            "Status changed"
        );
        self.status_changed.notify(&change);
        self.events
            .notify(&AssetEvent::StatusChanged(StatusChangedEvent {
                timestamp: change.timestamp,
                entity: change.entity,
                level: K::LEVEL,
                old: change.old.map(|s| s.to_string()),
                new: change.new.map(|s| s.to_string()),
            }));
    }

    // ── Children ───────────────────────────────────────────────

    /// Build, configure and, if no voter objects, publish a new child.
    ///
    /// `configure` runs before the child is visible to anyone. If it fails
    /// or the vote is vetoed, the hierarchy is left exactly as it was.
    pub fn create_child<F>(
        self: &Arc<Self>,
        id: AssetId,
        configure: F,
    ) -> AssetResult<ChildOutcome<K::Child>>
    where
        F: FnOnce(&Arc<K::Child>) -> Result<(), ConfigureError>,
    {
        let _structure = self.lock_structure();
        if self.children.contains_key(&id) {
            return Err(AssetError::DuplicateChild {
                parent: self.id.clone(),
                child: id,
            });
        }

        let weak_self: Weak<Self> = Arc::downgrade(self);
        let parent: Weak<dyn AttributeSource> = weak_self;
        let Some(child) = <K::Child as ChildNode>::detached(
            id.clone(),
            self.id.clone(),
            parent,
            self.history_capacity(),
        ) else {
            return Err(AssetError::LeafAsset {
                asset: self.id.clone(),
                level: K::LEVEL,
            });
        };
        let child = Arc::new(child);

        match catch_unwind(AssertUnwindSafe(|| configure(&child))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(parent = %self.id, child = %id, error = %e, "Child configuration failed");
                return Err(AssetError::ConfigureFailed {
                    child: id,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                error!(parent = %self.id, child = %id, "Child configuration panicked");
                return Err(AssetError::ConfigureFailed {
                    child: id,
                    reason: "configuration panicked".to_string(),
                });
            }
        }

        let change = ChildChange {
            timestamp: Utc::now(),
            parent: Arc::clone(self),
            child: Arc::clone(&child),
        };
        if let Verdict::Veto(reason) = self.child_added.vote(&change) {
            info!(parent = %self.id, child = %id, reason = %reason, "Child addition vetoed");
            self.events.notify(&AssetEvent::ChildAdded(ChildChangedEvent {
                timestamp: change.timestamp,
                parent: self.id.clone(),
                parent_level: K::LEVEL,
                child: id,
                approved: Some(false),
            }));
            return Ok(ChildOutcome::Vetoed { reason });
        }

        let slot = self.wire_child(&child);
        self.children.insert(id.clone(), slot);
        debug!(parent = %self.id, child = %id, level = %K::LEVEL, "Child added");

        self.child_added.notify(&change);
        self.events.notify(&AssetEvent::ChildAdded(ChildChangedEvent {
            timestamp: change.timestamp,
            parent: self.id.clone(),
            parent_level: K::LEVEL,
            child: id,
            approved: Some(true),
        }));
        self.recompute_status(change.timestamp);

        Ok(ChildOutcome::Added(child))
    }

    /// [`create_child`](Self::create_child) without a configuration step.
    pub fn add_child(self: &Arc<Self>, id: AssetId) -> AssetResult<ChildOutcome<K::Child>> {
        self.create_child(id, |_| Ok(()))
    }

    /// Unlink a child. Always succeeds for an existing child.
    pub fn remove_child(self: &Arc<Self>, id: &AssetId) -> AssetResult<Arc<K::Child>> {
        let _structure = self.lock_structure();
        let (_, slot) = self
            .children
            .remove(id)
            .ok_or_else(|| AssetError::ChildNotFound {
                parent: self.id.clone(),
                child: id.clone(),
            })?;

        slot.node.status_observers().unsubscribe(slot.status_subscription);
        slot.node.event_observers().unsubscribe(slot.event_subscription);
        slot.node.unlink();
        debug!(parent = %self.id, child = %id, "Child removed");

        let change = ChildChange {
            timestamp: Utc::now(),
            parent: Arc::clone(self),
            child: Arc::clone(&slot.node),
        };
        self.child_removed.notify(&change);
        self.events.notify(&AssetEvent::ChildRemoved(ChildChangedEvent {
            timestamp: change.timestamp,
            parent: self.id.clone(),
            parent_level: K::LEVEL,
            child: id.clone(),
            approved: None,
        }));
        self.recompute_status(change.timestamp);

        Ok(slot.node)
    }

    pub fn contains_child(&self, id: &AssetId) -> bool {
        self.children.contains_key(id)
    }

    pub fn get_child(&self, id: &AssetId) -> AssetResult<Arc<K::Child>> {
        self.try_get_child(id).ok_or_else(|| AssetError::ChildNotFound {
            parent: self.id.clone(),
            child: id.clone(),
        })
    }

    pub fn try_get_child(&self, id: &AssetId) -> Option<Arc<K::Child>> {
        self.children.get(id).map(|slot| Arc::clone(&slot.node))
    }

    /// Sorted by id.
    pub fn children(&self) -> Vec<Arc<K::Child>> {
        let mut children: Vec<_> = self
            .children
            .iter()
            .map(|entry| Arc::clone(&entry.value().node))
            .collect();
        children.sort_by(|a, b| a.id().cmp(b.id()));
        children
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    fn wire_child(self: &Arc<Self>, child: &Arc<K::Child>) -> ChildSlot<K::Child> {
        let parent = Arc::downgrade(self);
        let status_subscription = child.status_observers().subscribe(move |change| {
            if let Some(parent) = parent.upgrade() {
                parent.update_child_status(change);
            }
        });

        let parent = Arc::downgrade(self);
        let event_subscription = child.event_observers().subscribe(move |event| {
            if let Some(parent) = parent.upgrade() {
                parent.events.notify(event);
            }
        });

        ChildSlot {
            node: Arc::clone(child),
            status_subscription,
            event_subscription,
        }
    }

    fn lock_history(&self) -> MutexGuard<'_, StatusHistory<K::Status>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_structure(&self) -> MutexGuard<'_, ()> {
        self.structure.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: AssetKind> AttributeSource for AssetNode<K> {
    fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes.get(name)
    }
}

impl<K: AssetKind> ChildNode for AssetNode<K> {
    type Status = K::Status;

    fn detached(
        id: AssetId,
        parent_id: AssetId,
        parent: Weak<dyn AttributeSource>,
        history_capacity: usize,
    ) -> Option<Self> {
        Some(Self::build(id, Some(parent_id), Some(parent), history_capacity))
    }

    fn id(&self) -> &AssetId {
        &self.id
    }

    fn status(&self) -> Timestamped<K::Status> {
        self.lock_history().current().clone()
    }

    fn status_observers(&self) -> &Observers<StatusChange<K::Status>> {
        &self.status_changed
    }

    fn event_observers(&self) -> &Observers<AssetEvent> {
        &self.events
    }

    fn unlink(&self) {
        self.attributes.detach();
    }
}

impl<K: AssetKind> std::fmt::Debug for AssetNode<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetNode")
            .field("id", &self.id)
            .field("level", &K::LEVEL)
            .field("status", &self.status().value)
            .field("children", &self.child_count())
            .finish()
    }
}

/// Root asset with the default history capacity.
pub fn new_root<K: AssetKind>(id: AssetId) -> Arc<AssetNode<K>> {
    AssetNode::new_root(id, DEFAULT_HISTORY_CAPACITY)
}
