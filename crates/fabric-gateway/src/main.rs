//! Fabric Gateway — entry point.
//!
//! Reads layered configuration (defaults, optional TOML file, `FABRIC_*`
//! environment variables) and starts the axum-based HTTP ingress.
//!
//! # Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FABRIC_GATEWAY_CONFIG` | *(none)* | Path to a TOML config file. |
//! | `FABRIC_GATEWAY_HOST` | `gateway.svc` | This instance's bus host identity. |
//! | `FABRIC_PORTS` | `8080` | Comma-separated external listen ports. |
//! | `FABRIC_SECRET_KEY` | *(none)* | Shared secret required by the distributed `/metrics` collector. |

use fabric_gateway::{GatewayConfig, GatewayServer};
use fabric_runtime::InProcessBus;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("fabric_gateway=info".parse().unwrap()))
        .init();

    let config_path = std::env::var("FABRIC_GATEWAY_CONFIG").ok();
    let host = std::env::var("FABRIC_GATEWAY_HOST").unwrap_or_else(|_| "gateway.svc".to_string());

    let config = match GatewayConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load gateway configuration: {err}");
            std::process::exit(1);
        }
    };

    info!(
        ports = ?config.ports,
        host = %host,
        secret_key_configured = !config.secret_key.is_empty(),
        "fabric gateway configuration loaded"
    );

    let bus: Arc<dyn fabric_kernel::bus::Bus> = Arc::new(InProcessBus::new());
    let server = GatewayServer::new(config, bus, host, env!("CARGO_PKG_VERSION"));

    if let Err(err) = server.start().await {
        eprintln!("gateway error: {err}");
        std::process::exit(1);
    }
}
