//! Shared fixtures: real downstream services on ephemeral ports and
//! deterministic health probes.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use service_gateway::core::types::ServiceInstance;
use service_gateway::discovery::{HealthProbe, ProbeOutcome};

#[derive(Clone)]
struct BackendState {
    name: String,
    healthy: Arc<AtomicBool>,
    health_hits: Arc<AtomicUsize>,
    request_hits: Arc<AtomicUsize>,
}

/// A downstream service with a switchable `/health` endpoint. Every other
/// path echoes the request back as JSON.
pub struct MockBackend {
    pub addr: SocketAddr,
    healthy: Arc<AtomicBool>,
    health_hits: Arc<AtomicUsize>,
    request_hits: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockBackend {
    pub async fn start(name: &str) -> Self {
        let state = BackendState {
            name: name.to_string(),
            healthy: Arc::new(AtomicBool::new(true)),
            health_hits: Arc::new(AtomicUsize::new(0)),
            request_hits: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .route("/health", get(health))
            .fallback(echo)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            healthy: state.healthy,
            health_hits: state.health_hits,
            request_hits: state.request_hits,
            shutdown: Some(tx),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn health_hits(&self) -> usize {
        self.health_hits.load(Ordering::SeqCst)
    }

    pub fn request_hits(&self) -> usize {
        self.request_hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn health(State(state): State<BackendState>) -> impl IntoResponse {
    state.health_hits.fetch_add(1, Ordering::SeqCst);
    if state.healthy.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "down")
    }
}

async fn echo(State(state): State<BackendState>, request: Request) -> impl IntoResponse {
    state.request_hits.fetch_add(1, Ordering::SeqCst);
    let (parts, body) = request.into_parts();
    let body: Bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };

    Json(json!({
        "backend": state.name,
        "method": parts.method.as_str(),
        "path": parts.uri.path(),
        "query": parts.uri.query(),
        "request_id": header("x-request-id"),
        "forwarded_for": header("x-forwarded-for"),
        "connection": header("connection"),
        "body": String::from_utf8_lossy(&body),
    }))
}

/// Reports every instance healthy.
pub struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn check(&self, _instance: &ServiceInstance) -> ProbeOutcome {
        ProbeOutcome::Healthy
    }
}

/// Reports the listed instance ids unhealthy and every other instance healthy.
pub struct UnhealthyIds(pub HashSet<String>);

impl UnhealthyIds {
    pub fn new(ids: &[&str]) -> Self {
        Self(ids.iter().map(|id| id.to_string()).collect())
    }
}

#[async_trait]
impl HealthProbe for UnhealthyIds {
    async fn check(&self, instance: &ServiceInstance) -> ProbeOutcome {
        if self.0.contains(&instance.id) {
            ProbeOutcome::Unhealthy {
                reason: "scripted".to_string(),
            }
        } else {
            ProbeOutcome::Healthy
        }
    }
}

/// An address nothing listens on.
pub fn dead_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Poll `condition` every 10ms until it holds or `limit` passes.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
