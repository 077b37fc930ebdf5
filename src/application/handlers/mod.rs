//! Built-in message handlers every node serves.

mod handle_get_asset_status;
mod handle_heartbeat;
mod handle_status_notification;

use std::sync::Arc;

pub use handle_get_asset_status::GetAssetStatusHandler;
pub use handle_heartbeat::HeartbeatHandler;
pub use handle_status_notification::StatusNotificationHandler;

use crate::application::assets::SharedAssetRegistry;
use crate::application::router::ProtocolRouter;

pub const HEARTBEAT: &str = "Heartbeat";
pub const GET_ASSET_STATUS: &str = "GetAssetStatus";
pub const STATUS_NOTIFICATION: &str = "StatusNotification";

pub fn register_builtin_handlers(router: &ProtocolRouter, registry: SharedAssetRegistry) {
    router.register_handler(HEARTBEAT, HeartbeatHandler);
    router.register_handler(GET_ASSET_STATUS, GetAssetStatusHandler::new(Arc::clone(&registry)));
    router.register_handler(STATUS_NOTIFICATION, StatusNotificationHandler::new(registry));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use crate::application::assets::AssetRegistry;
    use crate::application::router::{RequestOptions, RouterConfig, RpcError};
    use crate::application::routing::{Connection, CredentialStore, RoutingTable};
    use crate::config::AppConfig;
    use crate::domain::ids::{AssetId, NodeId};
    use crate::domain::message::{ErrorCode, MessageHeader, Payload, ProtocolMessage, RequestMessage};
    use crate::domain::status::{AvailabilityStatus, SocketStatus};
    use crate::support::frame::{self, Frame};

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn asset(s: &str) -> AssetId {
        AssetId::new(s).unwrap()
    }

    fn setup() -> (Arc<ProtocolRouter>, SharedAssetRegistry) {
        let assets = AppConfig::from_toml(
            r#"
            [[assets.pools]]
            id = "POOL-1"

            [[assets.pools.stations]]
            id = "ST-1"
            sockets = ["ST-1-1", "ST-1-2"]
            "#,
        )
        .unwrap()
        .assets;
        let registry = Arc::new(AssetRegistry::from_config(&assets, None).unwrap());
        let router = Arc::new(ProtocolRouter::new(
            RouterConfig::default(),
            Arc::new(RoutingTable::new(node("CSMS"))),
            Arc::new(CredentialStore::new()),
        ));
        register_builtin_handlers(&router, Arc::clone(&registry));
        (router, registry)
    }

    async fn call(router: &ProtocolRouter, action: &str, payload: Value) -> Result<Value, RpcError> {
        router
            .send_request(node("CSMS"), action, Payload::Json(payload), RequestOptions::default())
            .await
            .map(|response| response.payload.as_json().cloned().unwrap_or_default())
    }

    #[tokio::test]
    async fn heartbeat_returns_current_time() {
        let (router, _) = setup();
        let body = call(&router, HEARTBEAT, json!({})).await.unwrap();
        assert!(body["currentTime"].is_string());
    }

    #[tokio::test]
    async fn status_notification_updates_socket_and_rollup() {
        let (router, registry) = setup();
        call(
            &router,
            STATUS_NOTIFICATION,
            json!({ "socketId": "ST-1-1", "status": "Occupied" }),
        )
        .await
        .unwrap();
        call(
            &router,
            STATUS_NOTIFICATION,
            json!({ "assetId": "ST-1-2", "status": "Occupied", "timestamp": "2026-01-01T00:00:00Z" }),
        )
        .await
        .unwrap();

        let socket = registry.socket(&asset("ST-1-1")).unwrap();
        assert_eq!(socket.status().value, SocketStatus::Occupied);
        let pool = registry.pool(&asset("POOL-1")).unwrap();
        assert_eq!(pool.status().value, AvailabilityStatus::Occupied);
    }

    #[tokio::test]
    async fn get_asset_status_reports_view() {
        let (router, registry) = setup();
        registry
            .set_socket_status(&asset("ST-1-2"), chrono::Utc::now(), SocketStatus::Available)
            .unwrap();

        let body = call(&router, GET_ASSET_STATUS, json!({ "assetId": "ST-1" })).await.unwrap();
        assert_eq!(body["asset_id"], "ST-1");
        assert_eq!(body["status"]["value"], "Available");
        assert_eq!(body["children"], json!(["ST-1-1", "ST-1-2"]));
    }

    #[tokio::test]
    async fn unknown_asset_is_a_response_error() {
        let (router, _) = setup();
        match call(&router, GET_ASSET_STATUS, json!({ "assetId": "NOPE" })).await {
            Err(RpcError::ResponseError(message)) => {
                assert_eq!(message.error.code, ErrorCode::PropertyConstraintViolation)
            }
            other => panic!("expected response error, got {other:?}"),
        }
        match call(&router, STATUS_NOTIFICATION, json!({ "status": "Occupied" })).await {
            Err(RpcError::ResponseError(message)) => {
                assert_eq!(message.error.code, ErrorCode::FormationViolation)
            }
            other => panic!("expected response error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_notification_as_one_way_message_from_station() {
        let (router, registry) = setup();
        let (connection, _outbound): (Connection, mpsc::Receiver<Frame>) = Connection::channel(4, None);
        let connection_id = router.connection_opened(connection, Some(node("ST-1")));

        let header = MessageHeader::new(node("ST-1"), node("CSMS"));
        let message = RequestMessage::new(
            header,
            STATUS_NOTIFICATION,
            Payload::Json(json!({ "socketId": "ST-1-1", "status": "Faulted" })),
        );
        router.handle_frame(connection_id, frame::encode(&ProtocolMessage::Send(message)));

        let socket = registry.socket(&asset("ST-1-1")).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while socket.status().value != SocketStatus::Faulted {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
