//! Local message handlers, looked up by action name.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::application::routing::ConnectionId;
use crate::domain::message::{ErrorInfo, MessageHeader, Payload};

/// What a handler knows about the message it is serving.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub header: MessageHeader,
    pub action: String,
    /// Connection the message arrived on; `None` for calls made by this node.
    pub connection: Option<ConnectionId>,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Serve a request. `Err` becomes a `ResponseError` reply.
    async fn handle_request(&self, ctx: &RequestContext, payload: Payload) -> Result<Payload, ErrorInfo>;

    /// Serve a one-way message. Nobody is waiting for the result.
    async fn handle_send(&self, ctx: &RequestContext, payload: Payload) {
        if let Err(error) = self.handle_request(ctx, payload).await {
            warn!(
                action = %ctx.action,
                source = %ctx.header.source,
                %error,
                "One-way message handler failed"
            );
        }
    }
}

pub type SharedHandler = Arc<dyn MessageHandler>;

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(RequestContext, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, ErrorInfo>> + Send,
{
    async fn handle_request(&self, ctx: &RequestContext, payload: Payload) -> Result<Payload, ErrorInfo> {
        (self.0)(ctx.clone(), payload).await
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, SharedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handler previously registered for `action`.
    pub fn register(&self, action: impl Into<String>, handler: SharedHandler) -> Option<SharedHandler> {
        let action = action.into();
        info!(%action, "Handler registered");
        self.handlers.insert(action, handler)
    }

    pub fn unregister(&self, action: &str) -> Option<SharedHandler> {
        self.handlers.remove(action).map(|(_, handler)| handler)
    }

    pub fn get(&self, action: &str) -> Option<SharedHandler> {
        self.handlers.get(action).map(|h| Arc::clone(h.value()))
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        actions.sort();
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::NodeId;
    use serde_json::json;

    fn ctx(action: &str) -> RequestContext {
        RequestContext {
            header: MessageHeader::new(NodeId::new("A").unwrap(), NodeId::new("B").unwrap()),
            action: action.to_string(),
            connection: None,
        }
    }

    #[tokio::test]
    async fn closures_serve_requests() {
        let registry = HandlerRegistry::new();
        registry.register(
            "Echo",
            Arc::new(FnHandler::new(|_ctx: RequestContext, payload: Payload| async move {
                Ok::<_, ErrorInfo>(payload)
            })),
        );

        let handler = registry.get("Echo").unwrap();
        let reply = handler
            .handle_request(&ctx("Echo"), Payload::Json(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(reply, Payload::Json(json!({"x": 1})));
        assert!(registry.get("Other").is_none());
        assert_eq!(registry.actions(), vec!["Echo".to_string()]);
    }
}
