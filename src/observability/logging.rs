//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` takes precedence over
//! the configured level when set.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

fn default_level() -> String {
    "service_gateway=info,tower_http=info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive string, e.g. `info` or `service_gateway=debug`
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| self.configured_filter())
    }

    /// The configured level, or the default directives when it does not parse
    fn configured_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new(default_level()))
    }
}

/// Install the subscriber. Returns `false` if one was already installed,
/// which is expected in tests that share a process.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let installed = match config.format {
        LogFormat::Json => Registry::default()
            .with(config.filter())
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
            .is_ok(),
        LogFormat::Text => Registry::default()
            .with(config.filter())
            .with(fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        info!(level = %config.level, format = ?config.format, "Structured logging initialized");
    } else {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
    installed
}
