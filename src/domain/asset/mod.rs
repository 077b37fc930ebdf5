//! Charging asset hierarchy: pools contain stations, stations contain sockets.

pub mod aggregation;
pub mod attributes;
pub mod events;
pub mod kind;
pub mod node;

pub use aggregation::{
    availability_rollup, occupancy_rollup, AsAvailability, Aggregator, StatusSnapshot,
};
pub use attributes::{names, AttributeChange, AttributeSource, AttributeStore};
pub use events::{AssetEvent, ChildChange, ChildStatusChange, StatusChange};
pub use kind::{AssetKind, AssetLevel, Pool, Socket, Station, StatusValue};
pub use node::{new_root, AssetNode, ChildNode, ChildOutcome, ChildStatusOf, ConfigureError, NoChildren};

pub type ChargingPool = AssetNode<Pool>;
pub type ChargingStation = AssetNode<Station>;
pub type ChargingSocket = AssetNode<Socket>;
