//! Configuration module
//!
//! TOML application configuration. Every section has defaults, so an empty
//! file (or no file at all) yields a runnable node.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ids::{AssetId, NodeId};
use crate::domain::status::DEFAULT_HISTORY_CAPACITY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// `~/.config/texnouz-mesh/config.toml`, or `./config.toml` when the
/// platform has no config directory.
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .map(|dir| dir.join("texnouz-mesh").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub server: ServerConfig,
    pub routes: Vec<RouteConfig>,
    pub credentials: Vec<CredentialConfig>,
    pub peers: Vec<PeerConfig>,
    pub assets: AssetsConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

// ── [node] ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: NodeId,
    pub request_timeout_secs: u64,
    pub max_hops: usize,
    pub outbound_queue_capacity: usize,
    /// WebSocket subprotocols offered, most preferred first.
    pub subprotocols: Vec<String>,
    /// Seconds between reverse-path purges.
    pub maintenance_interval_secs: u64,
}

impl NodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            request_timeout_secs: 30,
            max_hops: 8,
            outbound_queue_capacity: 256,
            subprotocols: vec!["ocpp2.1".to_string(), "ocpp2.0.1".to_string()],
            maintenance_interval_secs: 30,
        }
    }
}

fn default_node_id() -> NodeId {
    NodeId::from_static("CSMS")
}

// ── [server] ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ws_host: String,
    pub ws_port: u16,
    pub api_host: String,
    pub api_port: u16,
    /// Seconds allowed for graceful shutdown.
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_host: "0.0.0.0".to_string(),
            ws_port: 9000,
            api_host: "0.0.0.0".to_string(),
            api_port: 8080,
            shutdown_timeout: 30,
        }
    }
}

impl ServerConfig {
    pub fn ws_address(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }

    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

// ── [[routes]] / [[credentials]] / [[peers]] ───────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub destination: NodeId,
    pub hub: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub node_id: NodeId,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: NodeId,
    /// e.g. `ws://hub.example:9000/ocpp`; the local node id is appended.
    pub url: String,
}

// ── [assets] ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub status_history_capacity: usize,
    /// Nodes that receive every asset event as a one-way `AssetEvent` message.
    pub status_subscribers: Vec<NodeId>,
    pub pools: Vec<PoolConfig>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            status_history_capacity: DEFAULT_HISTORY_CAPACITY,
            status_subscribers: Vec::new(),
            pools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: AssetId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    pub id: AssetId,
    #[serde(default)]
    pub name: Option<String>,
    /// Overrides the pool address when set.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub sockets: Vec<AssetId>,
}

// ── [logging] ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.node.id.as_str(), "CSMS");
        assert_eq!(config.node.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.node.max_hops, 8);
        assert_eq!(config.assets.status_history_capacity, 15);
        assert_eq!(config.server.ws_address(), "0.0.0.0:9000");
        assert!(config.routes.is_empty());
    }

    #[test]
    fn full_file_parses() {
        let config = AppConfig::from_toml(
            r#"
            [node]
            id = "HUB-1"
            request_timeout_secs = 10

            [server]
            ws_port = 9100

            [[routes]]
            destination = "ST-9"
            hub = "HUB-2"

            [[credentials]]
            node_id = "ST-1"
            secret = "s3cret"

            [[peers]]
            node_id = "HUB-2"
            url = "ws://hub-2:9000/ocpp"

            [assets]
            status_subscribers = ["CSMS"]

            [[assets.pools]]
            id = "POOL-1"
            address = "Main St 1"

            [[assets.pools.stations]]
            id = "ST-1"
            sockets = ["ST-1-1", "ST-1-2"]

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.id.as_str(), "HUB-1");
        assert_eq!(config.node.max_hops, 8);
        assert_eq!(config.server.ws_port, 9100);
        assert_eq!(config.routes[0].hub.as_str(), "HUB-2");
        assert_eq!(config.credentials[0].secret, "s3cret");
        assert_eq!(config.peers[0].url, "ws://hub-2:9000/ocpp");
        assert_eq!(config.assets.pools[0].stations[0].sockets.len(), 2);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn invalid_node_id_is_rejected() {
        assert!(AppConfig::from_toml("[node]\nid = \"bad id\"").is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = AppConfig::load(Path::new("/nonexistent/mesh.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/mesh.toml"));
    }
}
