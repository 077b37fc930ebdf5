//! Live asset hierarchy of this node and the task publishing its changes.

pub mod publisher;
pub mod registry;

pub use publisher::{StatusPublisher, ASSET_EVENT_ACTION};
pub use registry::{AssetRef, AssetRegistry, AssetView, SharedAssetRegistry};
