//! The ingress configuration surface, layered via the `config` crate:
//! explicit builder calls outrank `FABRIC_<UPPER_SNAKE_KEY>` environment
//! variables, which outrank a TOML file passed at startup.

use crate::blocked_paths::BlockedPaths;
use crate::cors::AllowedOrigins;
use crate::port_mapping::PortMappings;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayConfigError {
    #[error("failed to load gateway configuration: {0}")]
    Source(#[from] config::ConfigError),
    #[error(transparent)]
    PortMappings(#[from] crate::port_mapping::PortMappingError),
}

/// The raw, serde-deserializable shape layered by the `config` crate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawGatewayConfig {
    ports: String,
    port_mappings: String,
    allowed_origins: String,
    blocked_paths: String,
    request_memory_limit_mib: u64,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
    read_header_timeout_ms: u64,
    time_budget_ms: i64,
    secret_key: String,
    login_page: String,
}

impl Default for RawGatewayConfig {
    fn default() -> Self {
        Self {
            ports: "8080".to_string(),
            port_mappings: "8080:*->*, 443:*->443, 80:*->443".to_string(),
            allowed_origins: String::new(),
            blocked_paths: String::new(),
            request_memory_limit_mib: 4096,
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            read_header_timeout_ms: 10_000,
            time_budget_ms: 30_000,
            secret_key: String::new(),
            login_page: "/login-page".to_string(),
        }
    }
}

/// The parsed, ready-to-use ingress configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ports: Vec<u16>,
    pub port_mappings: PortMappings,
    pub allowed_origins: AllowedOrigins,
    pub blocked_paths: BlockedPaths,
    pub request_memory_limit_mib: u64,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub read_header_timeout: Duration,
    pub time_budget_ms: i64,
    /// Shared secret the distributed metrics collector requires in its
    /// `secretKey` query parameter, unless empty or running locally.
    pub secret_key: String,
    pub login_page: String,
}

impl GatewayConfig {
    /// Load the layered configuration: defaults, then an optional TOML
    /// file, then `FABRIC_*` environment variables, then explicit
    /// overrides applied by the caller via [`GatewayConfigBuilder`].
    pub fn load(toml_path: Option<&str>) -> Result<Self, GatewayConfigError> {
        GatewayConfigBuilder::new().with_file(toml_path).build()
    }

    fn from_raw(raw: RawGatewayConfig) -> Result<Self, GatewayConfigError> {
        Ok(Self {
            ports: raw
                .ports
                .split(',')
                .filter_map(|p| p.trim().parse::<u16>().ok())
                .collect(),
            port_mappings: PortMappings::parse(&raw.port_mappings)?,
            allowed_origins: AllowedOrigins::parse(&raw.allowed_origins),
            blocked_paths: BlockedPaths::parse(&raw.blocked_paths),
            request_memory_limit_mib: raw.request_memory_limit_mib.max(1),
            read_timeout: Duration::from_millis(raw.read_timeout_ms),
            write_timeout: Duration::from_millis(raw.write_timeout_ms),
            read_header_timeout: Duration::from_millis(raw.read_header_timeout_ms),
            time_budget_ms: raw.time_budget_ms,
            secret_key: raw.secret_key,
            login_page: raw.login_page,
        })
    }
}

/// Builds a [`GatewayConfig`] from layered sources, in precedence order
/// lowest to highest: defaults, TOML file, environment, explicit overrides.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    toml_path: Option<String>,
    overrides: Vec<(&'static str, String)>,
}

impl GatewayConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: Option<&str>) -> Self {
        self.toml_path = path.map(str::to_string);
        self
    }

    pub fn with_ports(mut self, csv: impl Into<String>) -> Self {
        self.overrides.push(("ports", csv.into()));
        self
    }

    pub fn with_port_mappings(mut self, csv: impl Into<String>) -> Self {
        self.overrides.push(("port_mappings", csv.into()));
        self
    }

    pub fn with_allowed_origins(mut self, csv: impl Into<String>) -> Self {
        self.overrides.push(("allowed_origins", csv.into()));
        self
    }

    pub fn build(self) -> Result<GatewayConfig, GatewayConfigError> {
        let defaults = RawGatewayConfig::default();
        let mut builder = config::Config::builder()
            .set_default("ports", defaults.ports)?
            .set_default("port_mappings", defaults.port_mappings)?
            .set_default("allowed_origins", defaults.allowed_origins)?
            .set_default("blocked_paths", defaults.blocked_paths)?
            .set_default("request_memory_limit_mib", defaults.request_memory_limit_mib)?
            .set_default("read_timeout_ms", defaults.read_timeout_ms)?
            .set_default("write_timeout_ms", defaults.write_timeout_ms)?
            .set_default("read_header_timeout_ms", defaults.read_header_timeout_ms)?
            .set_default("time_budget_ms", defaults.time_budget_ms)?
            .set_default("secret_key", defaults.secret_key)?
            .set_default("login_page", defaults.login_page)?;

        if let Some(path) = &self.toml_path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("FABRIC").separator("_"));

        let mut built = builder.build()?;
        for (key, value) in &self.overrides {
            built = config::Config::builder()
                .add_source(built)
                .set_override(*key, value.clone())?
                .build()?;
        }

        let raw: RawGatewayConfig = built.try_deserialize()?;
        GatewayConfig::from_raw(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_into_a_usable_config() {
        let config = GatewayConfigBuilder::new().build().unwrap();
        assert_eq!(config.ports, vec![8080]);
        assert_eq!(config.request_memory_limit_mib, 4096);
    }

    #[test]
    fn explicit_overrides_outrank_defaults() {
        let config = GatewayConfigBuilder::new()
            .with_ports("4040,40443")
            .with_allowed_origins("allowed.origin")
            .build()
            .unwrap();
        assert_eq!(config.ports, vec![4040, 40443]);
        assert!(config.allowed_origins.allows("allowed.origin"));
        assert!(!config.allowed_origins.allows("evil.example"));
    }
}
