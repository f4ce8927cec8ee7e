//! # HTTP Server Module
//!
//! Assembles the gateway: owns the registry, load balancer, circuit breakers,
//! rate limiter and route table, wires them into an axum application and
//! serves it with graceful shutdown.
//!
//! Middleware runs in this order, outermost first:
//!
//! 1. request id assignment and propagation
//! 2. CORS
//! 3. panic recovery
//! 4. trace spans and the access log
//! 5. rate limiting
//! 6. admin API-key guard (privileged paths only)
//! 7. admin routes, or the proxy fallback
//!
//! Request ids sit outside CORS so short-circuited preflight responses carry
//! one too.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer, request_id::MakeRequestUuid, timeout::TimeoutLayer,
    trace::TraceLayer, ServiceBuilderExt,
};
use tracing::{error, info, warn};

use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::discovery::ServiceRegistry;
use crate::gateway::admin;
use crate::load_balancing::LoadBalancer;
use crate::middleware::{
    access_log_middleware, admin_auth_middleware, build_cors_layer, rate_limit_middleware,
    request_id_of, AdminAuthState, RateLimitState, SlidingWindowRateLimiter,
};
use crate::routing::{ProxyRequest, ProxyResponse, RequestRouter, RouteTable};

/// Components shared by every handler
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub limiter: Arc<SlidingWindowRateLimiter>,
    pub routes: Arc<RouteTable>,
    pub router: Arc<RequestRouter>,
    pub prometheus: Option<PrometheusHandle>,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl GatewayState {
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// The gateway process: state, background tasks and the HTTP surface
pub struct GatewayServer {
    state: Arc<GatewayState>,
    shutdown: CancellationToken,
    sweeper: Option<JoinHandle<()>>,
}

impl GatewayServer {
    /// Build the gateway with an HTTP health probe.
    ///
    /// Must be called from within a Tokio runtime: static instances are
    /// registered, and their probers spawned, immediately.
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let registry = Arc::new(ServiceRegistry::new(config.health_check.clone())?);
        Self::with_registry(config, registry, None)
    }

    /// Build the gateway around an existing registry and, optionally, an
    /// installed Prometheus recorder.
    pub fn with_registry(
        config: GatewayConfig,
        registry: Arc<ServiceRegistry>,
        prometheus: Option<PrometheusHandle>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let routes = Arc::new(RouteTable::new(config.routes.clone())?);
        let strategy = config.load_balancing.default_strategy;
        let balancer = Arc::new(match config.load_balancing.seed {
            Some(seed) => LoadBalancer::seeded(strategy, seed),
            None => LoadBalancer::new(strategy),
        });
        let breakers = registry.breakers().clone();
        let limiter = Arc::new(SlidingWindowRateLimiter::from_config(&config.rate_limit));
        let router = Arc::new(RequestRouter::new(
            registry.clone(),
            balancer.clone(),
            config.circuit_breaker.clone(),
            &config.upstream,
        )?);

        for descriptor in &config.static_instances {
            // validate() guarantees a service name on static instances
            let service = descriptor.service_name.clone().unwrap_or_default();
            let instance = registry.register(&service, descriptor.clone())?;
            info!(
                service = %service,
                instance_id = %instance.id,
                base_url = %instance.base_url,
                "Registered static instance"
            );
        }

        let shutdown = CancellationToken::new();
        let sweeper = config.rate_limit.enabled.then(|| {
            limiter
                .clone()
                .spawn_sweeper(config.rate_limit.sweep_interval, shutdown.child_token())
        });

        let state = Arc::new(GatewayState {
            config: Arc::new(config),
            registry,
            balancer,
            breakers,
            limiter,
            routes,
            router,
            prometheus,
            started_at: Utc::now(),
            started: Instant::now(),
        });

        Ok(Self {
            state,
            shutdown,
            sweeper,
        })
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.state.config
    }

    /// The full axum application, middleware included
    pub fn app(&self) -> Router {
        build_app(self.state.clone())
    }

    pub async fn bind(&self) -> GatewayResult<TcpListener> {
        let address = self.state.config.server.listen_address();
        TcpListener::bind(&address).await.map_err(|e| GatewayError::Io {
            message: format!("Failed to bind {}: {}", address, e),
        })
    }

    /// Serve until `signal` resolves, then drain in-flight requests and stop
    /// background tasks.
    pub async fn serve<F>(mut self, listener: TcpListener, signal: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let app = self.app();
        let token = self.shutdown.clone();

        info!(address = %local_addr, routes = self.state.routes.len(), "Gateway listening");

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = signal => {},
                _ = token.cancelled() => {},
            }
            info!("Shutdown requested, draining in-flight requests");
        })
        .await;

        self.shutdown();
        if let Some(sweeper) = self.sweeper.take() {
            if let Err(e) = sweeper.await {
                warn!(error = %e, "Rate limit sweeper ended abnormally");
            }
        }

        result.map_err(|e| GatewayError::Io {
            message: format!("Server error: {}", e),
        })
    }

    /// Stop the sweeper and every health prober.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.state.registry.shutdown();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Wire handlers and middleware around the shared state.
pub fn build_app(state: Arc<GatewayState>) -> Router {
    let config = state.config.clone();

    let mut app = Router::new()
        .merge(admin::routes())
        .fallback(dispatch)
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            AdminAuthState::new(&config.admin),
            admin_auth_middleware,
        ));

    if config.rate_limit.enabled {
        let rate_state = RateLimitState::new(state.limiter.clone(), &config.rate_limit.client_id_header);
        app = app.layer(middleware::from_fn_with_state(rate_state, rate_limit_middleware));
    }

    app = app
        .layer(TimeoutLayer::new(config.server.request_timeout))
        .layer(middleware::from_fn(access_log_middleware));

    if config.server.http_trace {
        app = app.layer(TraceLayer::new_for_http());
    }

    with_edge_layers(app, &config)
}

/// Request ids, CORS and panic recovery around an assembled router.
fn with_edge_layers(app: Router, config: &GatewayConfig) -> Router {
    app.layer(
        ServiceBuilder::new()
            .set_x_request_id(MakeRequestUuid)
            .propagate_x_request_id()
            .layer(build_cors_layer(&config.cors))
            .layer(middleware::from_fn(stamp_recovered_panic))
            .layer(CatchPanicLayer::custom(panic_response)),
    )
}

/// Marks a response produced by the panic handler
#[derive(Debug, Clone, Copy)]
struct RecoveredPanic;

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "Handler panicked");
    let mut response = recovered_panic_error().into_response();
    response.extensions_mut().insert(RecoveredPanic);
    response
}

fn recovered_panic_error() -> GatewayError {
    GatewayError::internal("unexpected failure while handling the request")
}

/// The panic handler never sees the request, so the request id is added to
/// its body here.
async fn stamp_recovered_panic(request: Request, next: Next) -> Response {
    let request_id = request_id_of(&request);
    let response = next.run(request).await;
    if response.extensions().get::<RecoveredPanic>().is_none() {
        return response;
    }
    warn!(
        request_id = request_id.as_deref().unwrap_or("-"),
        "Request ended in a recovered panic"
    );
    recovered_panic_error().into_response_with_request_id(request_id.as_deref())
}

/// Fallback handler: every path not claimed by an admin route is proxied.
async fn dispatch(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    let request_id = request_id_of(&request);
    match forward(&state, request, request_id.clone()).await {
        Ok(response) => response.into_response(),
        Err(err) => {
            if err.status_code().is_server_error() {
                warn!(
                    request_id = request_id.as_deref().unwrap_or("-"),
                    error = %err,
                    "Proxy request failed"
                );
            }
            err.into_response_with_request_id(request_id.as_deref())
        }
    }
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

async fn forward(
    state: &GatewayState,
    request: Request,
    request_id: Option<String>,
) -> GatewayResult<ProxyResponse> {
    let path = request.uri().path().to_string();
    let route = state
        .routes
        .resolve(&path)
        .ok_or_else(|| GatewayError::unknown_route(request.method().as_str(), path.as_str()))?;

    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let limit = state.config.server.max_body_size;
    let (parts, body) = request.into_parts();
    if declared_length(&parts.headers).is_some_and(|len| len > limit) {
        return Err(GatewayError::PayloadTooLarge { limit });
    }
    let body = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge { limit })?;

    let proxy_request = ProxyRequest {
        method: parts.method,
        headers: parts.headers,
        body,
        query: parts.uri.query().map(String::from),
        request_id,
        client_addr,
    };

    state
        .router
        .route_request(&route.service, &route.forward_path, proxy_request, route.strategy)
        .await
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        routing::get,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    async fn explode() -> StatusCode {
        panic!("handler exploded")
    }

    fn panicking_app() -> Router {
        with_edge_layers(Router::new().route("/boom", get(explode)), &GatewayConfig::default())
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_panic_response_carries_caller_request_id() {
        let response = panicking_app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/boom")
                    .header("x-request-id", "rid-77")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get("x-request-id").unwrap(), "rid-77");
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "internal_error");
        assert_eq!(body["request_id"], "rid-77");
    }

    #[tokio::test]
    async fn test_panic_response_carries_generated_request_id() {
        let response = panicking_app()
            .oneshot(HttpRequest::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let header = response
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body = body_json(response).await;
        assert_eq!(body["request_id"], header.as_str());
    }
}
