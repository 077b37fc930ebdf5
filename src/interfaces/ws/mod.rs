//! WebSocket interfaces
//!
//! - `node_server`: accepts neighbour nodes and feeds their frames to the router
//! - `peer_client`: dials configured peers and keeps them connected
//! - `notifications`: real-time event streaming to operators

pub mod node_server;
pub mod notifications;
pub mod peer_client;

pub use node_server::{NodeServer, NodeServerConfig};
pub use notifications::{
    create_notification_state, ws_notifications_handler, EventFilter, NotificationState,
};
pub use peer_client::PeerClient;
