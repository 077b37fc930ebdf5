//! Notifications module
//!
//! In-process notification primitives:
//!
//! - [`veto`]: two-phase vote/notify callbacks guarding hierarchy changes
//! - [`event_bus`]: broadcast channel fanning events out to async consumers
//!   (notification WebSocket, status publisher)
//!
//! # Usage
//! ```ignore
//! use texnouz_mesh::notifications::{create_event_bus, VetoNotificator, Verdict};
//!
//! let bus = create_event_bus();
//! let mut events = bus.subscribe();
//!
//! let on_add: VetoNotificator<String> = VetoNotificator::new("on_add");
//! on_add.register_voter(|id| {
//!     if id.starts_with("BAD") { Verdict::veto("rejected prefix") } else { Verdict::Approve }
//! });
//! ```

pub mod event_bus;
pub mod veto;

pub use event_bus::{create_event_bus, EventBus, EventSubscriber, SharedEventBus};
pub use veto::{HandlerId, Observer, Observers, Verdict, VetoNotificator, Voter};
