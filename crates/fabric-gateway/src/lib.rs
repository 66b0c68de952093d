//! Fabric Gateway - HTTP ingress, control plane, and distributed metrics
//! collection for the fabric's transport and dispatch core.
//!
//! This crate sits at the edge: it maps external HTTP ports to internal
//! `/host[:port]/route` bus subjects, carries the reserved control-plane
//! subjects every instance answers on port 888, and aggregates a
//! fabric-wide `/metrics` scrape via ping-based service discovery.
//!
//! # Reserved control-plane subjects (port 888)
//!
//! | Method | Path              | Description                          |
//! |--------|-------------------|---------------------------------------|
//! | `ANY`  | `/ping`           | Liveness probe                        |
//! | `ANY`  | `/config-refresh` | Reload layered configuration          |
//! | `ANY`  | `/trace`          | Diagnostic trace dump                 |
//! | `ANY`  | `/metrics`        | This instance's Prometheus exposition |
//!
//! # Example
//!
//! ```rust,no_run
//! use fabric_gateway::{GatewayConfig, GatewayServer};
//! use fabric_runtime::InProcessBus;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = GatewayConfig::load(None).unwrap();
//!     let bus = Arc::new(InProcessBus::new());
//!     let server = GatewayServer::new(config, bus, "gateway.svc", env!("CARGO_PKG_VERSION"));
//!     server.start().await.unwrap();
//! }
//! ```

pub mod blocked_paths;
pub mod config;
pub mod control_plane;
pub mod cors;
pub mod discovery;
pub mod error;
pub mod favicon;
pub mod memory_budget;
pub mod metrics_collector;
pub mod middleware_builtins;
pub mod port_mapping;
pub mod server;

pub use config::{GatewayConfig, GatewayConfigBuilder, GatewayConfigError};
pub use error::GatewayError;
pub use metrics_collector::MetricsRegistry;
pub use server::{GatewayServer, GatewayServerError};
