//! Heartbeat handler

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::application::router::{MessageHandler, RequestContext};
use crate::domain::message::{ErrorInfo, Payload};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatResponse {
    current_time: DateTime<Utc>,
}

pub struct HeartbeatHandler;

#[async_trait]
impl MessageHandler for HeartbeatHandler {
    async fn handle_request(&self, ctx: &RequestContext, _payload: Payload) -> Result<Payload, ErrorInfo> {
        debug!(source = %ctx.header.source, "Heartbeat");
        Payload::json(&HeartbeatResponse {
            current_time: Utc::now(),
        })
        .map_err(|e| ErrorInfo::internal(e.to_string()))
    }
}
