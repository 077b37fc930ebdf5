use serde::{Deserialize, Serialize};

use crate::domain::ids::NodeId;

/// Body of `PUT /api/credentials/{node_id}`
#[derive(Deserialize)]
pub struct SetCredentialRequest {
    pub secret: String,
}

#[derive(Debug, Serialize)]
pub struct CredentialChange {
    pub node_id: NodeId,
    pub fingerprint: String,
    pub replaced: bool,
}
