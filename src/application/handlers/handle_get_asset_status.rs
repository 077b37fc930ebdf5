//! GetAssetStatus handler
//!
//! Answers with the [`AssetView`](crate::application::assets::AssetView) of
//! any pool, station or socket known to this node.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::application::assets::SharedAssetRegistry;
use crate::application::router::{MessageHandler, RequestContext};
use crate::domain::ids::AssetId;
use crate::domain::message::{ErrorCode, ErrorInfo, Payload};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetAssetStatusRequest {
    asset_id: AssetId,
}

pub struct GetAssetStatusHandler {
    registry: SharedAssetRegistry,
}

impl GetAssetStatusHandler {
    pub fn new(registry: SharedAssetRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageHandler for GetAssetStatusHandler {
    async fn handle_request(&self, ctx: &RequestContext, payload: Payload) -> Result<Payload, ErrorInfo> {
        let req: GetAssetStatusRequest = payload
            .parse()
            .map_err(|e| ErrorInfo::new(ErrorCode::FormationViolation, e.to_string()))?;
        debug!(source = %ctx.header.source, asset_id = %req.asset_id, "GetAssetStatus");

        let Some(asset) = self.registry.find(&req.asset_id) else {
            return Err(ErrorInfo::new(
                ErrorCode::PropertyConstraintViolation,
                format!("Unknown asset {}", req.asset_id),
            ));
        };
        Payload::json(&asset.view()).map_err(|e| ErrorInfo::internal(e.to_string()))
    }
}
