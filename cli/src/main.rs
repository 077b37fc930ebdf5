//! Texnouz mesh node: CLI
//!
//! Headless charging-mesh node (station gateway, hub or central system)
//! suitable for deployment as a systemd service, Docker container, or
//! standalone process.
//!
//! ```sh
//! # Run with default config (~/.config/texnouz-mesh/config.toml)
//! mesh-node
//!
//! # Custom config path
//! mesh-node --config /etc/texnouz-mesh/config.toml
//!
//! # Override ports
//! mesh-node --api-port 8080 --ws-port 9000
//!
//! # Validate config without starting
//! mesh-node --check
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use texnouz_mesh::config::AppConfig;
use texnouz_mesh::server::{init_tracing, ServerHandle, ServerOptions};

/// Texnouz mesh node: routes charging-protocol messages between stations,
/// hubs and central systems.
#[derive(Parser, Debug)]
#[command(
    name = "mesh-node",
    version,
    about = "EV charging mesh node",
    long_about = "Texnouz mesh node: WebSocket relay + admin API for EV charging \
                  stations, hubs and central systems.\n\n\
                  Default config: ~/.config/texnouz-mesh/config.toml"
)]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(short, long, env = "MESH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the node id.
    #[arg(long)]
    node_id: Option<String>,

    /// Override the admin API listen port.
    #[arg(long)]
    api_port: Option<u16>,

    /// Override the node WebSocket listen port.
    #[arg(long)]
    ws_port: Option<u16>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration file and exit without starting the node.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // ── Load configuration ─────────────────────────────────────────
    let config_path = cli.config.unwrap_or_else(texnouz_mesh::default_config_path);

    let loaded = if config_path.exists() {
        AppConfig::load(&config_path).map(Some)
    } else {
        Ok(None)
    };

    let mut config = match loaded {
        Ok(Some(cfg)) => cfg,
        Ok(None) => AppConfig::default(),
        Err(e) if cli.check => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            // Fallback tracing init
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .init();
            error!("Failed to load config from {}: {}", config_path.display(), e);
            return Err(e.into());
        }
    };

    // ── Apply CLI overrides ────────────────────────────────────────
    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(port) = cli.api_port {
        config.server.api_port = port;
    }
    if let Some(port) = cli.ws_port {
        config.server.ws_port = port;
    }
    if let Some(ref id) = cli.node_id {
        config.node.id = id.parse()?;
    }

    // ── Config validation mode ─────────────────────────────────────
    if cli.check {
        println!("✅ Configuration is valid");
        println!("   Config file : {}", config_path.display());
        println!("   Node id     : {}", config.node.id);
        println!("   API address : {}", config.server.api_address());
        println!("   WS address  : {}", config.server.ws_address());
        println!("   Routes      : {}", config.routes.len());
        println!("   Peers       : {}", config.peers.len());
        println!("   Pools       : {}", config.assets.pools.len());
        println!("   Log level   : {}", config.logging.level);
        return Ok(());
    }

    init_tracing(&config);
    if config_path.exists() {
        info!("Configuration loaded from {}", config_path.display());
    } else {
        info!("No config at {}; using defaults", config_path.display());
    }

    // ── Start node ─────────────────────────────────────────────────
    let handle = ServerHandle::start(ServerOptions { config }).await?;

    // Install OS signal handlers (SIGTERM, SIGINT)
    handle.install_signal_handler();

    info!("🚀 Press Ctrl+C to shutdown gracefully.");

    handle.shutdown_signal().wait().await;
    handle.wait().await;

    Ok(())
}
