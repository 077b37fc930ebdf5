//! StatusNotification handler
//!
//! A station reports one of its sockets. Accepted both as a request (empty
//! response) and as a one-way message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::application::assets::SharedAssetRegistry;
use crate::application::router::{MessageHandler, RequestContext};
use crate::domain::error::AssetError;
use crate::domain::ids::AssetId;
use crate::domain::message::{ErrorCode, ErrorInfo, Payload};
use crate::domain::status::SocketStatus;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusNotificationRequest {
    #[serde(alias = "assetId")]
    socket_id: AssetId,
    status: SocketStatus,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

pub struct StatusNotificationHandler {
    registry: SharedAssetRegistry,
}

impl StatusNotificationHandler {
    pub fn new(registry: SharedAssetRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageHandler for StatusNotificationHandler {
    async fn handle_request(&self, ctx: &RequestContext, payload: Payload) -> Result<Payload, ErrorInfo> {
        let req: StatusNotificationRequest = payload
            .parse()
            .map_err(|e| ErrorInfo::new(ErrorCode::FormationViolation, e.to_string()))?;
        let timestamp = req.timestamp.unwrap_or_else(Utc::now);

        match self.registry.set_socket_status(&req.socket_id, timestamp, req.status) {
            Ok(changed) => {
                info!(
                    source = %ctx.header.source,
                    socket_id = %req.socket_id,
                    status = %req.status,
                    changed,
                    "StatusNotification"
                );
                Ok(Payload::empty())
            }
            Err(AssetError::AssetNotFound(id)) => {
                warn!(source = %ctx.header.source, socket_id = %id, "StatusNotification for unknown socket");
                Err(ErrorInfo::new(
                    ErrorCode::PropertyConstraintViolation,
                    format!("Unknown socket {id}"),
                ))
            }
            Err(e) => Err(ErrorInfo::internal(e.to_string())),
        }
    }
}
