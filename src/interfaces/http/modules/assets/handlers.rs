//! Asset API handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;

use crate::application::assets::{AssetRef, AssetView};
use crate::domain::ids::AssetId;
use crate::interfaces::http::common::{fail, ok, ApiResult};
use crate::interfaces::http::AdminState;

/// `GET /api/assets`: every root pool.
pub async fn list_pools(State(state): State<AdminState>) -> ApiResult<Vec<AssetView>> {
    ok(state
        .assets
        .pools()
        .into_iter()
        .map(|pool| AssetRef::Pool(pool).view())
        .collect())
}

/// `GET /api/assets/{asset_id}`: pool, station or socket.
pub async fn get_asset(
    State(state): State<AdminState>,
    Path(asset_id): Path<String>,
) -> ApiResult<AssetView> {
    let asset_id = AssetId::new(&asset_id).map_err(|e| fail(StatusCode::BAD_REQUEST, e.to_string()))?;
    match state.assets.find(&asset_id) {
        Some(asset) => ok(asset.view()),
        None => Err(fail(StatusCode::NOT_FOUND, format!("Asset not found: {asset_id}"))),
    }
}
