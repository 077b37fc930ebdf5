//! Credential API handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::info;

use super::dto::{CredentialChange, SetCredentialRequest};
use crate::application::routing::{hash_secret, CredentialInfo};
use crate::interfaces::http::common::{fail, ok, parse_node_id, ApiResponse, ApiResult};
use crate::interfaces::http::AdminState;

/// `GET /api/credentials`: node ids and fingerprints only.
pub async fn list_credentials(State(state): State<AdminState>) -> ApiResult<Vec<CredentialInfo>> {
    ok(state.router.credentials().list())
}

/// `PUT /api/credentials/{node_id}`
pub async fn set_credential(
    State(state): State<AdminState>,
    Path(node_id): Path<String>,
    Json(body): Json<SetCredentialRequest>,
) -> ApiResult<CredentialChange> {
    let node_id = parse_node_id(&node_id)?;
    if body.secret.is_empty() {
        return Err(fail(StatusCode::UNPROCESSABLE_ENTITY, "Secret must not be empty"));
    }

    let fingerprint = hash_secret(&body.secret);
    let replaced = state.router.credentials().set(node_id.clone(), body.secret);
    info!(%node_id, replaced, "Credential set via API");

    ok(CredentialChange {
        node_id,
        fingerprint,
        replaced,
    })
}

/// `DELETE /api/credentials/{node_id}`
pub async fn delete_credential(
    State(state): State<AdminState>,
    Path(node_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiResponse<()>>)> {
    let node_id = parse_node_id(&node_id)?;
    if state.router.credentials().clear(&node_id) {
        info!(%node_id, "Credential removed via API");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(fail(StatusCode::NOT_FOUND, format!("No credential for {node_id}")))
    }
}
