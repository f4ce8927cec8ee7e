//! # Control-Plane Endpoints
//!
//! Liveness, aggregate metrics and registry management. Everything under
//! `/admin` sits behind the API-key guard when keys are configured; `/health`
//! and `/metrics` stay open for probes and scrapers.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::core::circuit_breaker::CircuitBreakerSnapshot;
use crate::core::error::GatewayError;
use crate::core::types::{InstanceDescriptor, InstanceSnapshot};
use crate::gateway::server::GatewayState;
use crate::middleware::REQUEST_ID_HEADER;

type AdminResult<T> = Result<Json<T>, Response>;

/// Render an error with the caller's request id attached.
fn reject(err: GatewayError, headers: &HeaderMap) -> Response {
    let request_id = headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok());
    err.into_response_with_request_id(request_id)
}

pub fn routes() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_summary))
        .route("/metrics/prometheus", get(prometheus_metrics))
        .route("/admin/services", post(register_instance).get(list_services))
        .route("/admin/services/:service", get(get_service))
        .route(
            "/admin/services/:service/instances/:instance_id",
            delete(deregister_instance),
        )
        .route("/admin/routes", get(list_routes))
        .route("/admin/circuit-breakers", get(list_circuit_breakers))
        .route(
            "/admin/circuit-breakers/:service/:instance_id/reset",
            post(reset_circuit_breaker),
        )
}

#[derive(Debug, Serialize)]
pub struct RegistrationResponse {
    pub status: &'static str,
    pub instance: InstanceSnapshot,
}

#[derive(Debug, Serialize)]
pub struct DeregistrationResponse {
    pub status: &'static str,
    pub service: String,
    pub instance_id: String,
    /// `false` when nothing was registered under that id
    pub removed: bool,
}

/// Liveness of the gateway itself, independent of its backends.
async fn health(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let stats = state.registry.stats();
    Json(json!({
        "status": "healthy",
        "services": stats.total_services,
        "instances": stats.total_instances,
        "healthy_instances": stats.healthy_instances,
        "uptime_seconds": state.uptime().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
    }))
}

async fn metrics_summary(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let registry = state.registry.stats();
    Json(json!({
        "total_services": registry.total_services,
        "total_instances": registry.total_instances,
        "healthy_instances": registry.healthy_instances,
        "unhealthy_instances": registry.unhealthy_instances,
        "active_connections": registry.active_connections,
        "load_balancer": state.balancer.stats(),
        "rate_limiter": state.limiter.stats(),
        "circuit_breakers": {
            "total": state.breakers.len(),
            "open": state.breakers.open_count(),
        },
        "uptime_seconds": state.uptime().as_secs(),
        "timestamp": Utc::now(),
    }))
}

async fn prometheus_metrics(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => reject(GatewayError::not_found("prometheus exporter is not installed"), &headers),
    }
}

async fn register_instance(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    payload: Result<Json<InstanceDescriptor>, JsonRejection>,
) -> AdminResult<RegistrationResponse> {
    let Json(descriptor) = payload
        .map_err(|rejection| reject(GatewayError::invalid_request(rejection.body_text()), &headers))?;

    let service_name = match descriptor.service_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            return Err(reject(
                GatewayError::invalid_request("service_name is required"),
                &headers,
            ))
        }
    };

    let instance = state
        .registry
        .register(&service_name, descriptor)
        .map_err(|e| reject(e, &headers))?;

    Ok(Json(RegistrationResponse {
        status: "registered",
        instance: instance.snapshot(),
    }))
}

async fn list_services(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let services = state.registry.list_all();
    Json(json!({
        "total_services": services.len(),
        "services": services,
    }))
}

async fn get_service(
    State(state): State<Arc<GatewayState>>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> AdminResult<Value> {
    let instances: Vec<InstanceSnapshot> = state
        .registry
        .get_instances(&service)
        .iter()
        .map(|instance| instance.snapshot())
        .collect();

    if instances.is_empty() {
        return Err(reject(
            GatewayError::not_found(format!("service '{}'", service)),
            &headers,
        ));
    }

    let healthy = instances.iter().filter(|i| i.healthy).count();
    Ok(Json(json!({
        "service": service,
        "total_instances": instances.len(),
        "healthy_instances": healthy,
        "instances": instances,
    })))
}

async fn deregister_instance(
    State(state): State<Arc<GatewayState>>,
    Path((service, instance_id)): Path<(String, String)>,
) -> Json<DeregistrationResponse> {
    let removed = state.registry.deregister(&service, &instance_id);
    if let Some(instance) = &removed {
        state.balancer.forget_instance(&instance.key());
    } else {
        info!(service = %service, instance_id = %instance_id, "Deregistration of unknown instance ignored");
    }

    Json(DeregistrationResponse {
        status: "deregistered",
        service,
        instance_id,
        removed: removed.is_some(),
    })
}

async fn list_routes(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    Json(json!({ "routes": state.routes.routes() }))
}

async fn list_circuit_breakers(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let breakers: Vec<CircuitBreakerSnapshot> =
        state.breakers.get_all().iter().map(|b| b.snapshot()).collect();
    Json(json!({
        "total": breakers.len(),
        "open": state.breakers.open_count(),
        "circuit_breakers": breakers,
    }))
}

async fn reset_circuit_breaker(
    State(state): State<Arc<GatewayState>>,
    Path((service, instance_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<CircuitBreakerSnapshot>), Response> {
    let key = format!("{}/{}", service, instance_id);
    let breaker = state.breakers.get(&key).ok_or_else(|| {
        reject(
            GatewayError::not_found(format!("circuit breaker '{}'", key)),
            &headers,
        )
    })?;

    breaker.force_close();
    info!(breaker = %key, "Circuit breaker reset via admin API");
    Ok((StatusCode::OK, Json(breaker.snapshot())))
}
