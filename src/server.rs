//! Node runtime.
//!
//! [`ServerHandle`] owns the full lifecycle of a mesh node: metrics, the
//! routing table and credentials, the protocol router, the asset registry
//! and its publisher, the node WebSocket server, outbound peer links, the
//! admin API and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::assets::{AssetRegistry, SharedAssetRegistry, StatusPublisher};
use crate::application::handlers::register_builtin_handlers;
use crate::application::router::{ProtocolRouter, RouterConfig, SharedRouter};
use crate::application::routing::{CredentialStore, RoutingTable};
use crate::config::AppConfig;
use crate::interfaces::http::{create_api_router, AdminState};
use crate::interfaces::ws::{NodeServer, NodeServerConfig, PeerClient};
use crate::notifications::{create_event_bus, SharedEventBus};
use crate::support::shutdown::{ShutdownCoordinator, ShutdownSignal};

// ── Options ────────────────────────────────────────────────────────

/// Options for starting a mesh node.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Application configuration.
    pub config: AppConfig,
}

// ── ServerHandle ───────────────────────────────────────────────────

/// Handle to a running mesh node.
///
/// # Examples
///
/// ```rust,no_run
/// use texnouz_mesh::server::{ServerHandle, ServerOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let handle = ServerHandle::start(ServerOptions::default()).await?;
///     // ... wait for shutdown signal ...
///     handle.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct ServerHandle {
    /// Protocol router of this node.
    pub router: SharedRouter,
    /// Charging pools, stations and sockets hosted here.
    pub assets: SharedAssetRegistry,
    /// Shared event bus for real-time notifications.
    pub event_bus: SharedEventBus,
    /// The configuration the node was started with.
    pub config: AppConfig,
    /// Port the admin API is listening on.
    pub api_port: u16,
    /// Port the node WebSocket server is listening on.
    pub ws_port: u16,

    shutdown: ShutdownCoordinator,
    ws_task: JoinHandle<()>,
    api_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Start a mesh node with the given options.
    ///
    /// This will:
    /// 1. Install the Prometheus metrics recorder
    /// 2. Load routes and credentials into the routing table
    /// 3. Build the protocol router and register the built-in handlers
    /// 4. Build the asset registry and start the status publisher
    /// 5. Start the node WebSocket server and dial configured peers
    /// 6. Start the admin API and the maintenance task
    pub async fn start(opts: ServerOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let app_cfg = opts.config;
        let node_id = app_cfg.node.id.clone();

        info!(%node_id, "Starting Texnouz mesh node...");

        let prometheus_handle = prometheus_handle();

        // ── Routing table & credentials ────────────────────────
        let routes = Arc::new(RoutingTable::new(node_id.clone()));
        for route in &app_cfg.routes {
            routes.add_route(route.destination.clone(), route.hub.clone())?;
        }
        let credentials = Arc::new(CredentialStore::new());
        for credential in &app_cfg.credentials {
            credentials.set(credential.node_id.clone(), credential.secret.clone());
        }
        info!(
            routes = app_cfg.routes.len(),
            credentials = app_cfg.credentials.len(),
            "🧭 Routing table loaded"
        );

        // ── Event Bus ──────────────────────────────────────────
        let event_bus = create_event_bus();
        info!("🔔 Event bus initialized for real-time notifications");

        // ── Protocol router ────────────────────────────────────
        let router_config = RouterConfig {
            request_timeout: app_cfg.node.request_timeout(),
            max_hops: app_cfg.node.max_hops,
        };
        let router: SharedRouter = Arc::new(
            ProtocolRouter::new(router_config, routes, credentials).with_event_bus(event_bus.clone()),
        );

        // ── Assets ─────────────────────────────────────────────
        let (asset_tx, asset_rx) = mpsc::unbounded_channel();
        let assets: SharedAssetRegistry = Arc::new(AssetRegistry::from_config(&app_cfg.assets, Some(asset_tx))?);
        register_builtin_handlers(&router, assets.clone());
        info!(pools = assets.pools().len(), "🔌 Asset registry ready");

        // ── Shutdown coordinator ───────────────────────────────
        let shutdown = ShutdownCoordinator::new(app_cfg.server.shutdown_timeout);
        let shutdown_signal = shutdown.signal();

        // ── Background tasks ───────────────────────────────────
        let mut background = Vec::new();
        background.push(
            StatusPublisher::new(
                router.clone(),
                event_bus.clone(),
                app_cfg.assets.status_subscribers.clone(),
            )
            .start(asset_rx, shutdown_signal.clone()),
        );
        background.push(start_maintenance_task(
            router.clone(),
            Duration::from_secs(app_cfg.node.maintenance_interval_secs.max(1)),
            shutdown_signal.clone(),
        ));

        // ── Node WebSocket server ──────────────────────────────
        let ws_addr = app_cfg.server.ws_address();
        let ws_listener = TcpListener::bind(&ws_addr).await?;
        let ws_port = ws_listener.local_addr()?.port();
        let server = NodeServer::new(
            NodeServerConfig {
                address: ws_addr,
                subprotocols: app_cfg.node.subprotocols.clone(),
                outbound_queue_capacity: app_cfg.node.outbound_queue_capacity,
            },
            router.clone(),
        )
        .with_shutdown(shutdown_signal.clone());

        // ── Peers ──────────────────────────────────────────────
        for peer in &app_cfg.peers {
            let client = PeerClient::new(peer.node_id.clone(), peer.url.clone(), router.clone())
                .with_subprotocols(app_cfg.node.subprotocols.clone())
                .with_queue_capacity(app_cfg.node.outbound_queue_capacity);
            background.push(client.start(shutdown_signal.clone()));
        }

        // ── Admin API server ───────────────────────────────────
        let api_router = create_api_router(AdminState {
            router: router.clone(),
            assets: assets.clone(),
            event_bus: event_bus.clone(),
            prometheus: prometheus_handle,
            started_at: Instant::now(),
        });

        let api_addr = app_cfg.server.api_address();
        let listener = TcpListener::bind(&api_addr).await?;
        let api_port = listener.local_addr()?.port();
        info!("Admin API listening on http://{}:{}", app_cfg.server.api_host, api_port);

        let api_shutdown = shutdown_signal.clone();
        let api_server = axum::serve(
            listener,
            api_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            api_shutdown.wait().await;
            info!("🛑 Admin API received shutdown signal");
        });

        info!(%node_id, ws_port, api_port, "🚀 All servers started.");

        // ── Spawn server tasks ─────────────────────────────────
        let ws_task = tokio::spawn(async move {
            if let Err(e) = server.serve(ws_listener).await {
                error!("WebSocket server error: {}", e);
            }
        });

        let api_task = tokio::spawn(async move {
            if let Err(e) = api_server.await {
                error!("Admin API server error: {}", e);
            }
        });

        Ok(Self {
            router,
            assets,
            event_bus,
            config: app_cfg,
            api_port,
            ws_port,
            shutdown,
            ws_task,
            api_task,
            background,
        })
    }

    /// Get a cloneable shutdown signal.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }

    /// Install OS signal listeners (SIGTERM, SIGINT) that trigger shutdown.
    pub fn install_signal_handler(&self) {
        self.shutdown.start_signal_listener();
    }

    /// Trigger graceful shutdown (non-blocking).
    ///
    /// Call [`wait`](Self::wait) to block until everything has stopped.
    pub fn trigger_shutdown(&self) {
        self.shutdown.signal().trigger();
    }

    /// Wait for the node to fully stop after shutdown has been triggered.
    pub async fn wait(self) {
        info!("⏳ Waiting for server tasks to complete...");

        let Self {
            router,
            shutdown,
            ws_task,
            api_task,
            background,
            ..
        } = self;

        let completed = shutdown
            .shutdown_with_cleanup(|| async move {
                match ws_task.await {
                    Ok(()) => info!("WebSocket server stopped"),
                    Err(e) => error!("WebSocket server task panicked: {}", e),
                }
                match api_task.await {
                    Ok(()) => info!("Admin API server stopped"),
                    Err(e) => error!("Admin API server task panicked: {}", e),
                }
                for task in background {
                    if let Err(e) = task.await {
                        error!("Background task panicked: {}", e);
                    }
                }
            })
            .await;

        if !completed {
            warn!(
                pending_requests = router.pending_count(),
                "Some tasks were still running at shutdown"
            );
        }
        info!("👋 Texnouz mesh node shutdown complete");
    }

    /// Trigger shutdown and wait for completion.
    pub async fn shutdown(self) {
        info!("🛑 Shutting down mesh node...");
        self.trigger_shutdown();
        self.wait().await;
    }

    /// Check if the node is still running.
    pub fn is_running(&self) -> bool {
        !self.ws_task.is_finished() || !self.api_task.is_finished()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// The global recorder can be installed only once per process, so a
/// restarted node reuses the first handle.
fn prometheus_handle() -> PrometheusHandle {
    use std::sync::OnceLock;
    static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

    PROM_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                info!("📊 Prometheus metrics recorder installed");
                handle
            }
            Err(e) => {
                warn!(error = %e, "Metrics recorder already installed; /metrics will stay empty");
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

/// Periodically drops reverse-path entries whose requests have expired.
fn start_maintenance_task(router: SharedRouter, every: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = router.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Expired forwarded requests purged");
                    }
                    metrics::gauge!("mesh_pending_requests").set(router.pending_count() as f64);
                }
                _ = shutdown.wait() => break,
            }
        }
        debug!("Maintenance task stopped");
    })
}

/// Initialize tracing (logging) from the application config.
///
/// Call this once at process startup (before [`ServerHandle::start`]).
pub fn init_tracing(config: &AppConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}
