//! Asset registry
//!
//! Owns the root pools of this node and finds any asset below them by id.
//! Every hierarchy event is forwarded into an optional channel drained by
//! the [`StatusPublisher`](super::publisher::StatusPublisher).

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{AssetsConfig, PoolConfig, StationConfig};
use crate::domain::asset::{
    availability_rollup, names, AssetEvent, AssetKind, AssetLevel, AssetNode, ChargingPool,
    ChargingSocket, ChargingStation, ChildNode, ChildOutcome,
};
use crate::domain::error::{AssetError, AssetResult};
use crate::domain::ids::AssetId;
use crate::domain::status::{AvailabilityStatus, SocketStatus, Timestamped};

/// Any asset, whatever its level.
#[derive(Clone)]
pub enum AssetRef {
    Pool(Arc<ChargingPool>),
    Station(Arc<ChargingStation>),
    Socket(Arc<ChargingSocket>),
}

impl AssetRef {
    pub fn id(&self) -> &AssetId {
        match self {
            Self::Pool(a) => a.id(),
            Self::Station(a) => a.id(),
            Self::Socket(a) => a.id(),
        }
    }

    pub fn level(&self) -> AssetLevel {
        match self {
            Self::Pool(_) => AssetLevel::Pool,
            Self::Station(_) => AssetLevel::Station,
            Self::Socket(_) => AssetLevel::Socket,
        }
    }

    pub fn view(&self) -> AssetView {
        match self {
            Self::Pool(a) => AssetView::of(a),
            Self::Station(a) => AssetView::of(a),
            Self::Socket(a) => AssetView::of(a),
        }
    }
}

/// Serializable snapshot of one asset.
#[derive(Debug, Clone, Serialize)]
pub struct AssetView {
    pub asset_id: AssetId,
    pub level: AssetLevel,
    pub parent_id: Option<AssetId>,
    pub status: Timestamped<String>,
    /// Most recent first.
    pub history: Vec<Timestamped<String>>,
    pub children: Vec<AssetId>,
    /// Effective values, inherited ones included.
    pub attributes: Map<String, Value>,
}

impl AssetView {
    fn of<K: AssetKind>(node: &Arc<AssetNode<K>>) -> Self {
        let mut attributes = Map::new();
        let local = node.local_attribute_names();
        let wanted = names::WELL_KNOWN
            .iter()
            .map(|name| name.to_string())
            .chain(local);
        for name in wanted {
            if attributes.contains_key(&name) {
                continue;
            }
            if let Some(value) = node.attribute(&name) {
                attributes.insert(name, value);
            }
        }

        Self {
            asset_id: node.id().clone(),
            level: node.level(),
            parent_id: node.parent_id().cloned(),
            status: node.status().map(|s| s.to_string()),
            history: node
                .status_history()
                .into_iter()
                .map(|entry| entry.map(|s| s.to_string()))
                .collect(),
            children: node.children().iter().map(|c| c.id().clone()).collect(),
            attributes,
        }
    }
}

pub type SharedAssetRegistry = Arc<AssetRegistry>;

pub struct AssetRegistry {
    pools: DashMap<AssetId, Arc<ChargingPool>>,
    history_capacity: usize,
    sink: Option<mpsc::UnboundedSender<AssetEvent>>,
}

impl AssetRegistry {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            pools: DashMap::new(),
            history_capacity,
            sink: None,
        }
    }

    /// Forward every event of every pool (and its descendants) to `sink`.
    pub fn with_event_sink(mut self, sink: mpsc::UnboundedSender<AssetEvent>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the bootstrap topology.
    pub fn from_config(config: &AssetsConfig, sink: Option<mpsc::UnboundedSender<AssetEvent>>) -> AssetResult<Self> {
        let mut registry = Self::new(config.status_history_capacity);
        registry.sink = sink;
        for pool in &config.pools {
            registry.load_pool(pool)?;
        }
        Ok(registry)
    }

    fn load_pool(&self, config: &PoolConfig) -> AssetResult<()> {
        let pool = self.add_pool(config.id.clone())?;
        set_optional(&pool, names::NAME, &config.name);
        set_optional(&pool, names::ADDRESS, &config.address);
        set_optional(&pool, names::OPERATOR, &config.operator);

        for station in &config.stations {
            load_station(&pool, station)?;
        }
        info!(
            pool = %pool.id(),
            stations = pool.child_count(),
            "Pool loaded"
        );
        Ok(())
    }

    /// Register a new root pool. Its status is rolled up from its stations.
    pub fn add_pool(&self, id: AssetId) -> AssetResult<Arc<ChargingPool>> {
        if self.pools.contains_key(&id) {
            return Err(AssetError::DuplicateAsset(id));
        }
        let pool = ChargingPool::new_root(id.clone(), self.history_capacity);
        pool.set_aggregator(availability_rollup::<AvailabilityStatus>);
        if let Some(sink) = &self.sink {
            let sink = sink.clone();
            pool.on_event().subscribe(move |event: &AssetEvent| {
                if sink.send(event.clone()).is_err() {
                    warn!(entity = %event.entity(), "Asset event sink closed");
                }
            });
        }
        self.pools.insert(id, Arc::clone(&pool));
        Ok(pool)
    }

    pub fn remove_pool(&self, id: &AssetId) -> Option<Arc<ChargingPool>> {
        self.pools.remove(id).map(|(_, pool)| pool)
    }

    pub fn pool(&self, id: &AssetId) -> Option<Arc<ChargingPool>> {
        self.pools.get(id).map(|p| Arc::clone(p.value()))
    }

    /// Sorted by id.
    pub fn pools(&self) -> Vec<Arc<ChargingPool>> {
        let mut pools: Vec<_> = self.pools.iter().map(|p| Arc::clone(p.value())).collect();
        pools.sort_by(|a, b| a.id().cmp(b.id()));
        pools
    }

    /// Look an asset up at any level.
    pub fn find(&self, id: &AssetId) -> Option<AssetRef> {
        if let Some(pool) = self.pool(id) {
            return Some(AssetRef::Pool(pool));
        }
        for pool in self.pools() {
            if let Some(station) = pool.try_get_child(id) {
                return Some(AssetRef::Station(station));
            }
            for station in pool.children() {
                if let Some(socket) = station.try_get_child(id) {
                    return Some(AssetRef::Socket(socket));
                }
            }
        }
        None
    }

    pub fn socket(&self, id: &AssetId) -> AssetResult<Arc<ChargingSocket>> {
        match self.find(id) {
            Some(AssetRef::Socket(socket)) => Ok(socket),
            _ => Err(AssetError::AssetNotFound(id.clone())),
        }
    }

    /// Set a socket's status; returns whether it changed.
    pub fn set_socket_status(&self, id: &AssetId, timestamp: chrono::DateTime<chrono::Utc>, status: SocketStatus) -> AssetResult<bool> {
        Ok(self.socket(id)?.set_status(timestamp, status))
    }
}

fn load_station(pool: &Arc<ChargingPool>, config: &StationConfig) -> AssetResult<()> {
    let outcome = pool.create_child(config.id.clone(), |station| {
        set_optional(station, names::NAME, &config.name);
        set_optional(station, names::ADDRESS, &config.address);
        station.set_aggregator(availability_rollup::<SocketStatus>);
        Ok(())
    })?;
    let station = match outcome {
        ChildOutcome::Added(station) => station,
        ChildOutcome::Vetoed { reason } => {
            warn!(pool = %pool.id(), station = %config.id, %reason, "Station rejected");
            return Ok(());
        }
    };

    for socket in &config.sockets {
        if let ChildOutcome::Vetoed { reason } = station.add_child(socket.clone())? {
            warn!(station = %station.id(), %socket, %reason, "Socket rejected");
        }
    }
    Ok(())
}

fn set_optional<K: AssetKind>(node: &Arc<AssetNode<K>>, name: &str, value: &Option<String>) {
    if let Some(value) = value {
        node.set_attribute(name, value.clone());
    }
}
