//! # Request Router
//!
//! Proxies one request end-to-end: healthy-set lookup, instance selection,
//! connection accounting, the per-instance circuit breaker and the outbound
//! call.
//!
//! Routing is single-attempt. A transport failure marks the selected instance
//! unhealthy and surfaces as a 502; the request is never replayed against
//! another instance.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{ConnectionGuard, ServiceInstance};
use crate::discovery::ServiceRegistry;
use crate::load_balancing::{LoadBalancer, LoadBalancingStrategy};

pub const INSTANCE_ID_HEADER: &str = "x-gateway-instance-id";
pub const SERVICE_HEADER: &str = "x-gateway-service";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Connection-scoped headers that must not be forwarded in either direction
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_pool_max_idle_per_host() -> usize {
    32
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

/// Outbound client settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Upper bound on one proxied call, headers and body included
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout", with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout: default_pool_idle_timeout(),
        }
    }
}

/// The inbound request as the router forwards it
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Raw query string, without the leading `?`
    pub query: Option<String>,
    pub request_id: Option<String>,
    pub client_addr: Option<IpAddr>,
}

impl ProxyRequest {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            query: None,
            request_id: None,
            client_addr: None,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    fn carries_body(&self) -> bool {
        !(self.method == Method::GET || self.method == Method::HEAD) && !self.body.is_empty()
    }
}

/// A relayed downstream response
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub instance_id: String,
    pub service_name: String,
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// Headers named in `Connection` are hop-by-hop for this message only.
fn connection_scoped(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(axum::http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Translate inbound headers into the outbound client's header map.
///
/// Drops hop-by-hop headers along with `host` and `content-length`, which the
/// client recomputes, then appends the caller to `x-forwarded-for` and sets
/// the request id.
fn outbound_headers(request: &ProxyRequest) -> reqwest::header::HeaderMap {
    let scoped = connection_scoped(&request.headers);
    let mut headers = reqwest::header::HeaderMap::with_capacity(request.headers.len() + 2);

    for (name, value) in &request.headers {
        let lower = name.as_str();
        if is_hop_by_hop(lower)
            || lower == "host"
            || lower == "content-length"
            || lower == FORWARDED_FOR_HEADER
            || scoped.iter().any(|s| s == lower)
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    if let Some(forwarded) = forwarded_for(&request.headers, request.client_addr) {
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&forwarded) {
            headers.insert(FORWARDED_FOR_HEADER, value);
        }
    }

    if let Some(request_id) = &request.request_id {
        if let Ok(value) = reqwest::header::HeaderValue::from_str(request_id) {
            headers.insert(crate::middleware::REQUEST_ID_HEADER, value);
        }
    }

    headers
}

fn forwarded_for(headers: &HeaderMap, client: Option<IpAddr>) -> Option<String> {
    let existing = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (existing, client) {
        (Some(existing), Some(client)) => Some(format!("{}, {}", existing, client)),
        (Some(existing), None) => Some(existing.to_string()),
        (None, Some(client)) => Some(client.to_string()),
        (None, None) => None,
    }
}

/// Translate the downstream headers back, dropping hop-by-hop ones.
fn relayed_headers(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 2);
    for (name, value) in upstream {
        let lower = name.as_str();
        if is_hop_by_hop(lower) || lower == "content-length" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

fn target_url(instance: &ServiceInstance, path: &str, query: Option<&str>) -> String {
    let mut url = String::with_capacity(instance.base_url.len() + path.len() + 16);
    url.push_str(&instance.base_url);
    if !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Composes the registry, load balancer and circuit breakers into the proxy
/// hot path.
pub struct RequestRouter {
    registry: Arc<ServiceRegistry>,
    balancer: Arc<LoadBalancer>,
    breakers: Arc<CircuitBreakerRegistry>,
    breaker_config: CircuitBreakerConfig,
    client: reqwest::Client,
}

impl RequestRouter {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        balancer: Arc<LoadBalancer>,
        breaker_config: CircuitBreakerConfig,
        upstream: &UpstreamConfig,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(upstream.timeout)
            .connect_timeout(upstream.connect_timeout)
            .pool_max_idle_per_host(upstream.pool_max_idle_per_host)
            .pool_idle_timeout(upstream.pool_idle_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::HttpClient {
                message: format!("Failed to build upstream client: {}", e),
            })?;

        Ok(Self {
            breakers: registry.breakers().clone(),
            registry,
            balancer,
            breaker_config,
            client,
        })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Forward `request` to one healthy instance of `service_name` at `path`.
    pub async fn route_request(
        &self,
        service_name: &str,
        path: &str,
        request: ProxyRequest,
        strategy: Option<LoadBalancingStrategy>,
    ) -> GatewayResult<ProxyResponse> {
        let healthy = self.registry.get_healthy_instances(service_name);
        if healthy.is_empty() {
            counter!("gateway_proxy_rejections_total", "reason" => "no_healthy_instances").increment(1);
            return Err(GatewayError::no_healthy_instances(service_name));
        }

        let instance = self
            .balancer
            .select(service_name, &healthy, strategy)
            .ok_or_else(|| GatewayError::SelectionFailed {
                service: service_name.to_string(),
            })?;

        // released on every exit path below, including cancellation
        let guard = ConnectionGuard::acquire(instance);
        let instance = guard.instance();

        if !self.breaker_config.enabled {
            return self.dispatch(instance, path, request).await;
        }

        let breaker = self.breakers.get_or_create(&instance.key(), &self.breaker_config);
        breaker
            .execute(|| self.dispatch(instance, path, request))
            .await
            .map_err(|err| match err {
                CircuitBreakerError::Open { retry_after, .. } => {
                    counter!("gateway_proxy_rejections_total", "reason" => "circuit_open").increment(1);
                    debug!(
                        service = service_name,
                        instance_id = %instance.id,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Circuit open, failing fast"
                    );
                    GatewayError::CircuitOpen {
                        service: service_name.to_string(),
                        instance_id: instance.id.clone(),
                    }
                }
                CircuitBreakerError::Operation(err) => err,
            })
    }

    async fn dispatch(
        &self,
        instance: &Arc<ServiceInstance>,
        path: &str,
        request: ProxyRequest,
    ) -> GatewayResult<ProxyResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|_| GatewayError::invalid_request(format!("Unsupported method {}", request.method)))?;
        let url = target_url(instance, path, request.query.as_deref());

        let mut outbound = self
            .client
            .request(method, &url)
            .headers(outbound_headers(&request));
        if request.carries_body() {
            outbound = outbound.body(request.body.clone());
        }

        debug!(
            service = %instance.service_name,
            instance_id = %instance.id,
            url = %url,
            "Proxying request"
        );

        let upstream = match outbound.send().await {
            Ok(response) => response,
            Err(e) => return Err(self.transport_failure(instance, &e)),
        };

        let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut headers = relayed_headers(upstream.headers());
        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(e) => return Err(self.transport_failure(instance, &e)),
        };

        if let Ok(value) = HeaderValue::from_str(&instance.id) {
            headers.insert(INSTANCE_ID_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&instance.service_name) {
            headers.insert(SERVICE_HEADER, value);
        }

        counter!("gateway_proxy_responses_total", "service" => instance.service_name.clone())
            .increment(1);

        Ok(ProxyResponse {
            status,
            headers,
            body,
            instance_id: instance.id.clone(),
            service_name: instance.service_name.clone(),
        })
    }

    /// Mark the instance unhealthy ahead of its next probe and build the 502.
    fn transport_failure(&self, instance: &ServiceInstance, err: &reqwest::Error) -> GatewayError {
        let message = if err.is_timeout() {
            "upstream request timed out".to_string()
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else {
            err.to_string()
        };

        let was_healthy = instance.set_healthy(false);
        counter!("gateway_proxy_transport_errors_total", "service" => instance.service_name.clone())
            .increment(1);
        if was_healthy {
            counter!("gateway_health_transitions_total", "to" => "unhealthy").increment(1);
            warn!(
                service = %instance.service_name,
                instance_id = %instance.id,
                base_url = %instance.base_url,
                error = %message,
                "Instance marked unhealthy after transport failure"
            );
        }

        GatewayError::ProxyTransport {
            service: instance.service_name.clone(),
            instance_id: instance.id.clone(),
            message,
        }
    }
}
