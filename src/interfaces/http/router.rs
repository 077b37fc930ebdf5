//! Admin API router

use axum::{
    middleware,
    routing::{get, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::middleware::{http_metrics_middleware, request_id_middleware};
use super::modules::{assets, connections, credentials, health, metrics, routes};
use super::AdminState;
use crate::interfaces::ws::ws_notifications_handler;

/// Create the admin API router with all routes
pub fn create_api_router(state: AdminState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Routing table
        .route("/routes", get(routes::list_routes))
        .route("/routes/{destination}", put(routes::set_route))
        .route(
            "/routes/{destination}/{hub}",
            axum::routing::delete(routes::delete_route),
        )
        // Credentials
        .route("/credentials", get(credentials::list_credentials))
        .route(
            "/credentials/{node_id}",
            put(credentials::set_credential).delete(credentials::delete_credential),
        )
        // Connections and outbound requests
        .route("/connections", get(connections::list_connections))
        .route(
            "/requests",
            get(connections::list_pending_requests).post(connections::send_request),
        )
        .route(
            "/requests/{request_id}",
            axum::routing::delete(connections::cancel_request),
        )
        // Assets
        .route("/assets", get(assets::list_pools))
        .route("/assets/{asset_id}", get(assets::get_asset))
        // Notifications WebSocket
        .route("/notifications", get(ws_notifications_handler));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::prometheus_metrics))
        .nest("/api", api_routes)
        .route_layer(middleware::from_fn(http_metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::application::assets::AssetRegistry;
    use crate::application::handlers::register_builtin_handlers;
    use crate::application::router::{ProtocolRouter, RouterConfig};
    use crate::application::routing::{Connection, CredentialStore, RoutingTable};
    use crate::config::AppConfig;
    use crate::domain::ids::NodeId;
    use crate::notifications::create_event_bus;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn state() -> AdminState {
        let assets = AppConfig::from_toml(
            r#"
            [[assets.pools]]
            id = "POOL-1"

            [[assets.pools.stations]]
            id = "ST-1"
            sockets = ["ST-1-1"]
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
        AdminState {
            router,
            assets: registry,
            event_bus: create_event_bus(),
            prometheus: PrometheusBuilder::new().build_recorder().handle(),
            started_at: Instant::now(),
        }
    }

    async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_node() {
        let app = create_api_router(state());
        let (status, body) = call(app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["node_id"], "CSMS");
    }

    #[tokio::test]
    async fn route_lifecycle() {
        let state = state();
        let app = create_api_router(state.clone());

        let (status, body) = call(
            app.clone(),
            Method::PUT,
            "/api/routes/ST-9",
            Some(json!({ "hub": "HUB-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["hub"], "HUB-1");
        assert_eq!(state.router.routes().relay_hub(&node("ST-9")), Some(node("HUB-1")));

        let (status, _) = call(
            app.clone(),
            Method::PUT,
            "/api/routes/CSMS",
            Some(json!({ "hub": "HUB-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = call(app.clone(), Method::GET, "/api/routes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["destination"], "ST-9");

        let (status, _) = call(app.clone(), Method::DELETE, "/api/routes/ST-9/HUB-2", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(app, Method::DELETE, "/api/routes/ST-9/HUB-1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.router.routes().relay_hub(&node("ST-9")).is_none());
    }

    #[tokio::test]
    async fn credentials_never_expose_secrets() {
        let state = state();
        let app = create_api_router(state.clone());

        let (status, body) = call(
            app.clone(),
            Method::PUT,
            "/api/credentials/ST-1",
            Some(json!({ "secret": "s3cret" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["replaced"], false);

        let (_, body) = call(app.clone(), Method::GET, "/api/credentials", None).await;
        let listed = body.to_string();
        assert!(listed.contains("ST-1"));
        assert!(!listed.contains("s3cret"));

        let (status, _) = call(
            app.clone(),
            Method::PUT,
            "/api/credentials/bad%20id",
            Some(json!({ "secret": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(app, Method::DELETE, "/api/credentials/ST-1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!state.router.credentials().contains(&node("ST-1")));
    }

    #[tokio::test]
    async fn assets_are_browsable() {
        let app = create_api_router(state());
        let (status, body) = call(app.clone(), Method::GET, "/api/assets/ST-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["parent_id"], "POOL-1");

        let (status, body) = call(app.clone(), Method::GET, "/api/assets", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["asset_id"], "POOL-1");

        let (status, _) = call(app, Method::GET, "/api/assets/NOPE", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn requests_go_through_the_router() {
        let state = state();
        let app = create_api_router(state.clone());

        let (status, body) = call(
            app.clone(),
            Method::POST,
            "/api/requests",
            Some(json!({ "destination": "CSMS", "action": "Heartbeat" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["payload"]["currentTime"].is_string());

        let (status, _) = call(
            app.clone(),
            Method::POST,
            "/api/requests",
            Some(json!({ "destination": "ST-404", "action": "Heartbeat" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            app.clone(),
            Method::POST,
            "/api/requests",
            Some(json!({ "destination": "CSMS", "action": "Nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, _) = call(app, Method::DELETE, "/api/requests/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn connections_are_listed() {
        let state = state();
        let (connection, _rx) = Connection::channel(4, Some("10.0.0.7:5000".into()));
        state.router.connection_opened(connection, Some(node("ST-1")));

        let app = create_api_router(state);
        let (status, body) = call(app, Method::GET, "/api/connections", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["node_id"], "ST-1");
        assert_eq!(body["data"][0]["remote_addr"], "10.0.0.7:5000");
    }

    #[tokio::test]
    async fn metrics_endpoint_renders() {
        let app = create_api_router(state());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
