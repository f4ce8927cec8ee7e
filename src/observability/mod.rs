pub mod logging;
pub mod metrics;

pub use logging::{init_tracing, LogFormat, LoggingConfig};
pub use metrics::install_prometheus_recorder;
