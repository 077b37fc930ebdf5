//! HTTP admin API
//!
//! - `common`: response envelope and path validation
//! - `middleware`: request id and request metrics
//! - `modules`: handlers per resource (routes, credentials, connections,
//!   assets, health, metrics)
//! - `router`: the axum router tying them together

pub mod common;
pub mod middleware;
pub mod modules;
pub mod router;

use std::time::Instant;

use axum::extract::FromRef;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::application::assets::SharedAssetRegistry;
use crate::application::router::SharedRouter;
use crate::interfaces::ws::NotificationState;
use crate::notifications::SharedEventBus;
use modules::metrics::MetricsState;

pub use router::create_api_router;

/// State shared by every admin handler. Axum extracts the narrower
/// per-module states via `FromRef`.
#[derive(Clone)]
pub struct AdminState {
    pub router: SharedRouter,
    pub assets: SharedAssetRegistry,
    pub event_bus: SharedEventBus,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

impl FromRef<AdminState> for MetricsState {
    fn from_ref(s: &AdminState) -> Self {
        MetricsState {
            handle: s.prometheus.clone(),
        }
    }
}

impl FromRef<AdminState> for NotificationState {
    fn from_ref(s: &AdminState) -> Self {
        NotificationState {
            event_bus: s.event_bus.clone(),
        }
    }
}
