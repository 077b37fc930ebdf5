//! Connection and request API handlers

use std::time::Duration;

use axum::extract::{Path, State};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;
use tracing::info;

use super::dto::{SendRequestBody, SendRequestResult};
use crate::application::router::{ConnectionInfo, PendingInfo, RequestOptions, RpcError};
use crate::application::DeliveryError;
use crate::domain::ids::RequestId;
use crate::domain::message::Payload;
use crate::interfaces::http::common::{fail, ok, parse_node_id, ApiResponse, ApiResult};
use crate::interfaces::http::AdminState;

/// `GET /api/connections`
pub async fn list_connections(State(state): State<AdminState>) -> ApiResult<Vec<ConnectionInfo>> {
    ok(state.router.connections())
}

/// `GET /api/requests`: outbound requests still waiting for a reply.
pub async fn list_pending_requests(State(state): State<AdminState>) -> ApiResult<Vec<PendingInfo>> {
    ok(state.router.pending_requests())
}

/// `DELETE /api/requests/{request_id}`
pub async fn cancel_request(
    State(state): State<AdminState>,
    Path(request_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiResponse<()>>)> {
    let request_id = RequestId::from(request_id);
    if state.router.cancel_request(&request_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(fail(
            StatusCode::NOT_FOUND,
            format!("No pending request {request_id}"),
        ))
    }
}

/// `POST /api/requests`: send a message from this node and wait for the
/// outcome.
pub async fn send_request(
    State(state): State<AdminState>,
    Json(body): Json<SendRequestBody>,
) -> ApiResult<SendRequestResult> {
    let destination = parse_node_id(&body.destination)?;
    if body.action.is_empty() {
        return Err(fail(StatusCode::UNPROCESSABLE_ENTITY, "Action must not be empty"));
    }
    let payload = match body.payload {
        Value::Null => Payload::empty(),
        value => Payload::Json(value),
    };
    let options = RequestOptions {
        timeout: body.timeout_secs.map(Duration::from_secs),
        ..RequestOptions::default()
    };
    info!(%destination, action = %body.action, one_way = body.one_way, "Sending message via API");

    if body.one_way {
        state
            .router
            .send_message(destination.clone(), body.action.clone(), payload, options)
            .await
            .map_err(|e| {
                let status = match e {
                    DeliveryError::Unreachable(_) => StatusCode::NOT_FOUND,
                    DeliveryError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                fail(status, e.to_string())
            })?;
        return ok(SendRequestResult {
            destination,
            action: body.action,
            request_id: None,
            event_tracking_id: None,
            payload: None,
        });
    }

    let response = state
        .router
        .send_request(destination.clone(), body.action.clone(), payload, options)
        .await
        .map_err(|e| fail(rpc_status(&e), e.to_string()))?;
    ok(SendRequestResult {
        destination,
        action: body.action,
        request_id: Some(response.header.request_id),
        event_tracking_id: Some(response.header.event_tracking_id),
        payload: Some(match response.payload {
            Payload::Json(value) => value,
            Payload::Binary(bytes) => Value::String(BASE64.encode(bytes)),
        }),
    })
}

fn rpc_status(error: &RpcError) -> StatusCode {
    match error {
        RpcError::Unreachable(_) => StatusCode::NOT_FOUND,
        RpcError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        RpcError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        RpcError::Cancelled(_) | RpcError::DuplicateRequest(_) => StatusCode::CONFLICT,
        RpcError::RequestError(_) | RpcError::ResponseError(_) => StatusCode::BAD_GATEWAY,
    }
}
