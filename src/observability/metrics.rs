//! Prometheus exposition for the counters and histograms recorded through the
//! `metrics` facade across the gateway.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::core::error::{GatewayError, GatewayResult};

pub const REQUEST_DURATION: &str = "gateway_request_duration_seconds";
pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const REGISTERED_SERVICES: &str = "gateway_registered_services";
pub const REGISTERED_INSTANCES: &str = "gateway_registered_instances";

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Install the global Prometheus recorder and return the render handle.
///
/// Only one recorder may be installed per process; a second call fails.
pub fn install_prometheus_recorder() -> GatewayResult<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), LATENCY_BUCKETS)
        .map_err(|e| GatewayError::config(format!("Failed to set histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| GatewayError::internal(format!("Failed to install Prometheus recorder: {}", e)))?;

    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_histogram!(REQUEST_DURATION, Unit::Seconds, "Inbound request latency");
    describe_counter!(REQUESTS_TOTAL, "Inbound requests by status class and method");
    describe_gauge!(REGISTERED_SERVICES, "Services with at least one registered instance");
    describe_gauge!(REGISTERED_INSTANCES, "Registered instances across all services");
    describe_counter!("gateway_lb_selections_total", "Successful instance selections");
    describe_counter!("gateway_health_transitions_total", "Instance health flips");
    describe_counter!("gateway_rate_limit_decisions_total", "Rate limiter decisions by outcome");
    describe_counter!("gateway_circuit_breaker_rejections_total", "Calls refused by an open breaker");
    describe_counter!("gateway_proxy_transport_errors_total", "Upstream transport failures");
}
