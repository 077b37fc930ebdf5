//! Routing table
//!
//! Per-destination entry holding an optional live direct connection and an
//! optional static relay hub. One entry is read under one shard lock, so a
//! resolution never mixes the state of two concurrent updates.

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionId};
use crate::domain::ids::NodeId;

/// Where a message for some destination goes next.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Destination is this node.
    Local,
    /// Destination is a live neighbour.
    Direct(Connection),
    /// Destination is reached through `hub`, a live neighbour.
    Relay { hub: NodeId, connection: Connection },
    Unreachable,
}

impl Resolution {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Direct(_) => "direct",
            Self::Relay { .. } => "relay",
            Self::Unreachable => "unreachable",
        }
    }

    /// Connection the message should be written to, if any.
    pub fn connection(&self) -> Option<&Connection> {
        match self {
            Self::Direct(connection) | Self::Relay { connection, .. } => Some(connection),
            Self::Local | Self::Unreachable => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("cannot route {0} to itself")]
    RouteToSelf(NodeId),
    #[error("relay hub for {0} cannot be the destination itself")]
    HubIsDestination(NodeId),
    #[error("relay hub cannot be the local node {0}")]
    HubIsLocal(NodeId),
}

#[derive(Debug, Default, Clone)]
struct RouteEntry {
    direct: Option<Connection>,
    relay_hub: Option<NodeId>,
}

impl RouteEntry {
    fn is_empty(&self) -> bool {
        self.direct.is_none() && self.relay_hub.is_none()
    }
}

/// Snapshot of one destination, for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub destination: NodeId,
    pub connection_id: Option<ConnectionId>,
    pub connected: bool,
    pub relay_hub: Option<NodeId>,
}

pub struct RoutingTable {
    local_id: NodeId,
    entries: DashMap<NodeId, RouteEntry>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            entries: DashMap::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Local > Direct > Relay > Unreachable. A relay resolves only when the
    /// hub itself is a live neighbour; the hub re-resolves on receipt.
    pub fn resolve(&self, destination: &NodeId) -> Resolution {
        if destination == &self.local_id {
            return Resolution::Local;
        }

        let (direct, relay_hub) = match self.entries.get(destination) {
            Some(entry) => (entry.direct.clone(), entry.relay_hub.clone()),
            None => return Resolution::Unreachable,
        };

        if let Some(connection) = direct.filter(Connection::is_open) {
            return Resolution::Direct(connection);
        }

        if let Some(hub) = relay_hub {
            match self.direct(&hub) {
                Some(connection) => return Resolution::Relay { hub, connection },
                None => debug!(%destination, %hub, "Relay hub is not connected"),
            }
        }

        Resolution::Unreachable
    }

    // ── Static routes ──────────────────────────────────────

    /// Install or replace the relay hub for `destination`. Returns the hub
    /// it replaced.
    pub fn add_route(&self, destination: NodeId, hub: NodeId) -> Result<Option<NodeId>, RoutingError> {
        if destination == self.local_id {
            return Err(RoutingError::RouteToSelf(destination));
        }
        if hub == destination {
            return Err(RoutingError::HubIsDestination(destination));
        }
        if hub == self.local_id {
            return Err(RoutingError::HubIsLocal(hub));
        }

        info!(%destination, %hub, "Static route added");
        let mut entry = self.entries.entry(destination).or_default();
        Ok(entry.relay_hub.replace(hub))
    }

    /// Remove the route to `destination` only if it points at `hub`.
    pub fn remove_route(&self, destination: &NodeId, hub: &NodeId) -> bool {
        let removed = match self.entries.get_mut(destination) {
            Some(mut entry) if entry.relay_hub.as_ref() == Some(hub) => {
                entry.relay_hub = None;
                true
            }
            _ => false,
        };
        if removed {
            self.entries.remove_if(destination, |_, entry| entry.is_empty());
            info!(%destination, %hub, "Static route removed");
        }
        removed
    }

    pub fn relay_hub(&self, destination: &NodeId) -> Option<NodeId> {
        self.entries.get(destination)?.relay_hub.clone()
    }

    // ── Direct connections ─────────────────────────────────

    /// Make `connection` the direct path to `node`, replacing any previous one.
    pub fn attach(&self, node: NodeId, connection: Connection) -> Option<Connection> {
        debug!(%node, connection_id = %connection.id(), "Direct connection attached");
        let mut entry = self.entries.entry(node).or_default();
        entry.direct.replace(connection)
    }

    /// Drop the direct path to `node` if it is still `connection_id`; a newer
    /// connection for the same node is left alone.
    pub fn detach(&self, node: &NodeId, connection_id: ConnectionId) -> bool {
        let detached = match self.entries.get_mut(node) {
            Some(mut entry)
                if entry.direct.as_ref().map(Connection::id) == Some(connection_id) =>
            {
                entry.direct = None;
                true
            }
            _ => false,
        };
        if detached {
            self.entries.remove_if(node, |_, entry| entry.is_empty());
            debug!(%node, %connection_id, "Direct connection detached");
        }
        detached
    }

    /// Live direct connection to `node`.
    pub fn direct(&self, node: &NodeId) -> Option<Connection> {
        self.entries
            .get(node)?
            .direct
            .clone()
            .filter(Connection::is_open)
    }

    /// Every known destination, sorted by id.
    pub fn routes(&self) -> Vec<RouteInfo> {
        let mut routes: Vec<RouteInfo> = self
            .entries
            .iter()
            .map(|entry| RouteInfo {
                destination: entry.key().clone(),
                connection_id: entry.direct.as_ref().map(Connection::id),
                connected: entry.direct.as_ref().is_some_and(Connection::is_open),
                relay_hub: entry.relay_hub.clone(),
            })
            .collect();
        routes.sort_by(|a, b| a.destination.cmp(&b.destination));
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn resolution_priority() {
        let table = RoutingTable::new(node("LOCAL"));
        assert!(matches!(table.resolve(&node("LOCAL")), Resolution::Local));
        assert!(matches!(table.resolve(&node("D")), Resolution::Unreachable));

        let (hub_conn, _hub_rx) = Connection::channel(4, None);
        table.attach(node("H"), hub_conn.clone());
        table.add_route(node("D"), node("H")).unwrap();
        match table.resolve(&node("D")) {
            Resolution::Relay { hub, connection } => {
                assert_eq!(hub, node("H"));
                assert_eq!(connection.id(), hub_conn.id());
            }
            other => panic!("expected relay, got {other:?}"),
        }

        let (d_conn, _d_rx) = Connection::channel(4, None);
        table.attach(node("D"), d_conn.clone());
        match table.resolve(&node("D")) {
            Resolution::Direct(connection) => assert_eq!(connection.id(), d_conn.id()),
            other => panic!("expected direct, got {other:?}"),
        }
    }

    #[test]
    fn closed_direct_connection_falls_back_to_relay() {
        let table = RoutingTable::new(node("LOCAL"));
        let (hub_conn, _hub_rx) = Connection::channel(4, None);
        table.attach(node("H"), hub_conn);
        table.add_route(node("D"), node("H")).unwrap();

        let (d_conn, d_rx) = Connection::channel(4, None);
        table.attach(node("D"), d_conn);
        drop(d_rx);

        assert_eq!(table.resolve(&node("D")).kind(), "relay");
    }

    #[test]
    fn relay_through_disconnected_hub_is_unreachable() {
        let table = RoutingTable::new(node("LOCAL"));
        table.add_route(node("D"), node("H")).unwrap();
        assert_eq!(table.resolve(&node("D")).kind(), "unreachable");
    }

    #[test]
    fn invalid_routes_are_rejected() {
        let table = RoutingTable::new(node("LOCAL"));
        assert_eq!(
            table.add_route(node("LOCAL"), node("H")),
            Err(RoutingError::RouteToSelf(node("LOCAL")))
        );
        assert_eq!(
            table.add_route(node("D"), node("D")),
            Err(RoutingError::HubIsDestination(node("D")))
        );
        assert_eq!(
            table.add_route(node("D"), node("LOCAL")),
            Err(RoutingError::HubIsLocal(node("LOCAL")))
        );
    }

    #[test]
    fn remove_route_requires_matching_hub() {
        let table = RoutingTable::new(node("LOCAL"));
        table.add_route(node("D"), node("H1")).unwrap();
        assert!(!table.remove_route(&node("D"), &node("H2")));
        assert!(table.remove_route(&node("D"), &node("H1")));
        assert!(table.routes().is_empty());
    }

    #[test]
    fn detach_ignores_newer_connection() {
        let table = RoutingTable::new(node("LOCAL"));
        let (old, _old_rx) = Connection::channel(4, None);
        let (new, _new_rx) = Connection::channel(4, None);
        table.attach(node("D"), old.clone());
        table.attach(node("D"), new.clone());

        assert!(!table.detach(&node("D"), old.id()));
        assert_eq!(table.direct(&node("D")).map(|c| c.id()), Some(new.id()));
        assert!(table.detach(&node("D"), new.id()));
        assert!(table.direct(&node("D")).is_none());
    }

    #[test]
    fn routes_snapshot_is_sorted() {
        let table = RoutingTable::new(node("LOCAL"));
        let (conn, _rx) = Connection::channel(4, None);
        table.attach(node("B"), conn);
        table.add_route(node("A"), node("B")).unwrap();

        let routes = table.routes();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destination, node("A"));
        assert_eq!(routes[0].relay_hub, Some(node("B")));
        assert!(routes[1].connected);
    }
}
