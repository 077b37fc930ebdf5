use serde::{Deserialize, Serialize};

use crate::domain::ids::NodeId;

/// Body of `PUT /api/routes/{destination}`
#[derive(Debug, Deserialize)]
pub struct SetRouteRequest {
    pub hub: String,
}

#[derive(Debug, Serialize)]
pub struct RouteChange {
    pub destination: NodeId,
    pub hub: NodeId,
    /// Hub the route pointed at before, if any.
    pub replaced: Option<NodeId>,
}
