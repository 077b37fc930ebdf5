//! Background task that fans asset events out.
//!
//! Every event drained from the registry sink goes to the in-process event
//! bus and, as a one-way `AssetEvent` message, to each configured
//! subscriber node.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::router::{RequestOptions, SharedRouter};
use crate::domain::asset::AssetEvent;
use crate::domain::events::Event;
use crate::domain::ids::NodeId;
use crate::domain::message::Payload;
use crate::notifications::SharedEventBus;
use crate::support::shutdown::ShutdownSignal;

/// Action name of the one-way message sent to subscribers.
pub const ASSET_EVENT_ACTION: &str = "AssetEvent";

pub struct StatusPublisher {
    router: SharedRouter,
    event_bus: SharedEventBus,
    subscribers: Vec<NodeId>,
}

impl StatusPublisher {
    pub fn new(router: SharedRouter, event_bus: SharedEventBus, subscribers: Vec<NodeId>) -> Self {
        Self {
            router,
            event_bus,
            subscribers,
        }
    }

    /// Drain `events` until the sender side is gone or shutdown fires.
    pub fn start(self, mut events: mpsc::UnboundedReceiver<AssetEvent>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(subscribers = self.subscribers.len(), "📣 Status publisher started");
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => self.publish(event).await,
                        None => break,
                    },
                    _ = shutdown.wait() => break,
                }
            }
            info!("📣 Status publisher stopped");
        })
    }

    async fn publish(&self, event: AssetEvent) {
        let event = Event::from(event);
        self.event_bus.publish(event.clone());
        if self.subscribers.is_empty() {
            return;
        }

        let payload = match Payload::json(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, event_type = event.event_type(), "Cannot encode asset event");
                return;
            }
        };
        for subscriber in &self.subscribers {
            match self
                .router
                .send_message(
                    subscriber.clone(),
                    ASSET_EVENT_ACTION,
                    payload.clone(),
                    RequestOptions::default(),
                )
                .await
            {
                Ok(()) => debug!(%subscriber, event_type = event.event_type(), "Asset event sent"),
                Err(e) => warn!(%subscriber, error = %e, "Asset event not delivered"),
            }
        }
    }
}
