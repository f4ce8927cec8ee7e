//! # Configuration Module
//!
//! Gateway configuration loaded from YAML or JSON, with `GATEWAY_*`
//! environment overrides applied on top and validated as a whole.
//!
//! Every section defaults independently, so a file only needs to name what
//! it changes. Durations are written in humantime form (`30s`, `500ms`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::InstanceDescriptor;
use crate::discovery::HealthCheckConfig;
use crate::load_balancing::LoadBalancingStrategy;
use crate::middleware::{AdminConfig, CorsConfig, RateLimitConfig};
use crate::observability::{LogFormat, LoggingConfig};
use crate::routing::{RouteDefinition, RouteTable, UpstreamConfig};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG_PATH";
/// Used when `GATEWAY_CONFIG_PATH` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerSettings,

    /// Path prefix to service name mapping
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    /// Outbound proxy client
    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Instances registered at startup; each must name its service
    #[serde(default)]
    pub static_instances: Vec<InstanceDescriptor>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

/// Listener and inbound request limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest inbound body the gateway buffers, in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Deadline for one inbound request, proxying included
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Emit tower-http trace spans per request
    #[serde(default = "default_true")]
    pub http_trace: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_body_size: default_max_body_size(),
            request_timeout: default_request_timeout(),
            http_trace: true,
        }
    }
}

impl ServerSettings {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancingConfig {
    #[serde(default)]
    pub default_strategy: LoadBalancingStrategy,

    /// Fixes the random source for reproducible weighted/random selection
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GatewayConfig {
    /// Load configuration from a YAML or JSON file, chosen by extension.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let mut config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    pub fn from_json_str(content: &str) -> GatewayResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Variables follow the pattern `GATEWAY_<SECTION>_<FIELD>`, for example
    /// `GATEWAY_SERVER_PORT=9090`.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with an
    /// injectable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> GatewayResult<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid {}: {}", key, e)))
        }

        fn duration(key: &str, value: &str) -> GatewayResult<Duration> {
            humantime::parse_duration(value.trim())
                .map_err(|e| GatewayError::config(format!("Invalid {}: {}", key, e)))
        }

        // Server
        if let Some(addr) = lookup("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        if let Some(port) = lookup("GATEWAY_SERVER_PORT") {
            self.server.port = parsed("GATEWAY_SERVER_PORT", &port)?;
        }
        if let Some(size) = lookup("GATEWAY_SERVER_MAX_BODY_SIZE") {
            self.server.max_body_size = parsed("GATEWAY_SERVER_MAX_BODY_SIZE", &size)?;
        }
        if let Some(timeout) = lookup("GATEWAY_SERVER_REQUEST_TIMEOUT") {
            self.server.request_timeout = duration("GATEWAY_SERVER_REQUEST_TIMEOUT", &timeout)?;
        }

        // Health checks
        if let Some(interval) = lookup("GATEWAY_HEALTH_CHECK_INTERVAL") {
            self.health_check.interval = duration("GATEWAY_HEALTH_CHECK_INTERVAL", &interval)?;
        }
        if let Some(timeout) = lookup("GATEWAY_HEALTH_CHECK_TIMEOUT") {
            self.health_check.timeout = duration("GATEWAY_HEALTH_CHECK_TIMEOUT", &timeout)?;
        }

        // Load balancing
        if let Some(strategy) = lookup("GATEWAY_LOAD_BALANCING_STRATEGY") {
            self.load_balancing.default_strategy = strategy
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_LOAD_BALANCING_STRATEGY: {}", e)))?;
        }
        if let Some(seed) = lookup("GATEWAY_LOAD_BALANCING_SEED") {
            self.load_balancing.seed = Some(parsed("GATEWAY_LOAD_BALANCING_SEED", &seed)?);
        }

        // Circuit breaker
        if let Some(enabled) = lookup("GATEWAY_CIRCUIT_BREAKER_ENABLED") {
            self.circuit_breaker.enabled = parsed("GATEWAY_CIRCUIT_BREAKER_ENABLED", &enabled)?;
        }
        if let Some(max) = lookup("GATEWAY_CIRCUIT_BREAKER_MAX_FAILURES") {
            self.circuit_breaker.max_failures = parsed("GATEWAY_CIRCUIT_BREAKER_MAX_FAILURES", &max)?;
        }
        if let Some(timeout) = lookup("GATEWAY_CIRCUIT_BREAKER_TIMEOUT") {
            self.circuit_breaker.timeout = duration("GATEWAY_CIRCUIT_BREAKER_TIMEOUT", &timeout)?;
        }

        // Rate limiting
        if let Some(enabled) = lookup("GATEWAY_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = parsed("GATEWAY_RATE_LIMIT_ENABLED", &enabled)?;
        }
        if let Some(max) = lookup("GATEWAY_RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limit.max_requests = parsed("GATEWAY_RATE_LIMIT_MAX_REQUESTS", &max)?;
        }
        if let Some(window) = lookup("GATEWAY_RATE_LIMIT_WINDOW") {
            self.rate_limit.window = duration("GATEWAY_RATE_LIMIT_WINDOW", &window)?;
        }

        // Admin keys, comma separated
        if let Some(keys) = lookup("GATEWAY_ADMIN_API_KEYS") {
            self.admin.api_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }

        // Logging
        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.logging.format = match format.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_LOG_FORMAT: {} (expected json or text)",
                        other
                    )))
                }
            };
        }

        Ok(())
    }

    /// Check the whole configuration, reporting every problem at once.
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.trim().is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        }
        if self.server.max_body_size == 0 {
            errors.push("server.max_body_size must be greater than 0".to_string());
        }
        if self.server.request_timeout.is_zero() {
            errors.push("server.request_timeout must be greater than 0".to_string());
        }

        if self.health_check.interval.is_zero() {
            errors.push("health_check.interval must be greater than 0".to_string());
        }
        if self.health_check.timeout.is_zero() {
            errors.push("health_check.timeout must be greater than 0".to_string());
        }
        if self.health_check.path.trim().is_empty() {
            errors.push("health_check.path cannot be empty".to_string());
        }

        if self.circuit_breaker.enabled {
            if self.circuit_breaker.max_failures == 0 {
                errors.push("circuit_breaker.max_failures must be greater than 0".to_string());
            }
            if self.circuit_breaker.timeout.is_zero() {
                errors.push("circuit_breaker.timeout must be greater than 0".to_string());
            }
        }

        if self.rate_limit.enabled {
            if self.rate_limit.max_requests == 0 {
                errors.push("rate_limit.max_requests must be greater than 0".to_string());
            }
            if self.rate_limit.window.is_zero() {
                errors.push("rate_limit.window must be greater than 0".to_string());
            }
            if axum::http::HeaderName::from_bytes(self.rate_limit.client_id_header.as_bytes()).is_err() {
                errors.push(format!(
                    "rate_limit.client_id_header '{}' is not a valid header name",
                    self.rate_limit.client_id_header
                ));
            }
        }

        if self.upstream.timeout.is_zero() {
            errors.push("upstream.timeout must be greater than 0".to_string());
        }

        if let Err(e) = RouteTable::new(self.routes.clone()) {
            errors.push(e.to_string());
        }

        for (index, descriptor) in self.static_instances.iter().enumerate() {
            match descriptor.service_name.as_deref().map(str::trim) {
                None | Some("") => errors.push(format!(
                    "static_instances[{}] ({}) must name its service",
                    index, descriptor.base_url
                )),
                Some(_) => {}
            }
            if let Err(e) = descriptor.validate() {
                errors.push(format!("static_instances[{}]: {}", index, e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}
