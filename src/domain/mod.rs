//! Domain layer: identifiers, the charging asset hierarchy, protocol
//! messages and the events both produce.

pub mod asset;
pub mod error;
pub mod events;
pub mod ids;
pub mod message;
pub mod status;

pub use error::{AssetError, AssetResult};
pub use ids::{AssetId, EventTrackingId, IdError, NodeId, RequestId};
pub use message::{ErrorCode, ErrorInfo, MessageHeader, Payload, ProtocolMessage};
