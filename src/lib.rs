//! # Texnouz charging mesh
//!
//! A node of an EV-charging mesh: stations, hubs and central systems
//! exchange request/response messages over WebSocket links and relay them
//! hop by hop towards their destination.
//!
//! ## Architecture
//!
//! - **domain**: identifiers, message model, status history and the
//!   pool/station/socket asset hierarchy
//! - **notifications**: veto notificators and the in-process event bus
//! - **application**: routing table, credential store, protocol router,
//!   asset registry and built-in handlers
//! - **interfaces**: node WebSocket server, peer client and admin API
//! - **support**: wire framing, retry and graceful shutdown
//! - **server**: wires everything into a running node

pub mod application;
pub mod config;
pub mod domain;
pub mod interfaces;
pub mod notifications;
pub mod server;
pub mod support;

pub use config::{default_config_path, AppConfig};

pub use application::{ProtocolRouter, RoutingTable, SharedRouter};

// Re-export API router
pub use interfaces::http::create_api_router;

// Re-export notifications
pub use notifications::{create_event_bus, EventBus, SharedEventBus};
