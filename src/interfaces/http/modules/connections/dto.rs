use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ids::{EventTrackingId, NodeId, RequestId};

/// Body of `POST /api/requests`
#[derive(Debug, Deserialize)]
pub struct SendRequestBody {
    pub destination: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    /// Overrides the node's default request timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Send without waiting for a reply.
    #[serde(default)]
    pub one_way: bool,
}

#[derive(Debug, Serialize)]
pub struct SendRequestResult {
    pub destination: NodeId,
    pub action: String,
    pub request_id: Option<RequestId>,
    pub event_tracking_id: Option<EventTrackingId>,
    /// Reply payload (binary payloads as base64); absent for one-way messages.
    pub payload: Option<Value>,
}
