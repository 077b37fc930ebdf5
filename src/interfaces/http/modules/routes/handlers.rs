//! Route API handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::info;

use super::dto::{RouteChange, SetRouteRequest};
use crate::application::routing::RouteInfo;
use crate::interfaces::http::common::{fail, ok, parse_node_id, ApiResponse, ApiResult};
use crate::interfaces::http::AdminState;

/// `GET /api/routes`
pub async fn list_routes(State(state): State<AdminState>) -> ApiResult<Vec<RouteInfo>> {
    ok(state.router.routes().routes())
}

/// `PUT /api/routes/{destination}`
pub async fn set_route(
    State(state): State<AdminState>,
    Path(destination): Path<String>,
    Json(body): Json<SetRouteRequest>,
) -> ApiResult<RouteChange> {
    let destination = parse_node_id(&destination)?;
    let hub = parse_node_id(&body.hub)?;

    let replaced = state
        .router
        .routes()
        .add_route(destination.clone(), hub.clone())
        .map_err(|e| fail(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    info!(%destination, %hub, ?replaced, "Route set via API");

    ok(RouteChange {
        destination,
        hub,
        replaced,
    })
}

/// `DELETE /api/routes/{destination}/{hub}`
pub async fn delete_route(
    State(state): State<AdminState>,
    Path((destination, hub)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, Json<ApiResponse<()>>)> {
    let destination = parse_node_id(&destination)?;
    let hub = parse_node_id(&hub)?;

    if state.router.routes().remove_route(&destination, &hub) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(fail(
            StatusCode::NOT_FOUND,
            format!("No route to {destination} via {hub}"),
        ))
    }
}
