//! # Rate Limiting
//!
//! Per-client sliding-window admission control.
//!
//! Each client identifier maps to the timestamps of its admitted requests
//! inside the trailing window. A check first drops timestamps that have aged
//! out, then admits the request only if fewer than `max_requests` remain.
//! Refused requests are not recorded, so a client hammering the gateway does
//! not push its own recovery further out.
//!
//! State is local to this process. Windows that have fully drained are
//! removed by [`SlidingWindowRateLimiter::sweep`], which a background task
//! runs every `sweep_interval`; without it the map would keep one entry per
//! client id ever seen.
//!
//! Client identity for inbound requests is, in order: the configured header
//! (default `x-client-id`), the peer IP address, then `"anonymous"`.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::GatewayError;
use crate::middleware::request_id_of;

pub const ANONYMOUS_CLIENT: &str = "anonymous";

fn default_enabled() -> bool {
    true
}

fn default_max_requests() -> u32 {
    200
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_client_id_header() -> String {
    "x-client-id".to_string()
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Requests admitted per client within one window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Length of the trailing window
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Header carrying the caller's client identifier
    #[serde(default = "default_client_id_header")]
    pub client_id_header: String,

    /// How often drained client windows are evicted
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_requests: default_max_requests(),
            window: default_window(),
            client_id_header: default_client_id_header(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Result of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the oldest admitted request leaves the window
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub allowed_requests: u64,
    pub denied_requests: u64,
    pub evicted_clients: u64,
    pub tracked_clients: usize,
    pub max_requests: u32,
    pub window_ms: u64,
}

pub struct SlidingWindowRateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    max_requests: u32,
    window: Duration,
    allowed: AtomicU64,
    denied: AtomicU64,
    evicted: AtomicU64,
}

impl SlidingWindowRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window)
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit or refuse one request from `client_id`
    pub fn is_allowed(&self, client_id: &str) -> bool {
        self.check(client_id).allowed
    }

    /// Admission check that also reports quota details
    pub fn check(&self, client_id: &str) -> RateLimitDecision {
        let now = Instant::now();
        let decision = match self.windows.get_mut(client_id) {
            Some(mut timestamps) => self.admit(&mut timestamps, now),
            None => {
                let mut timestamps = self.windows.entry(client_id.to_string()).or_default();
                self.admit(&mut timestamps, now)
            }
        };

        if decision.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            counter!("gateway_rate_limit_decisions_total", "decision" => "allowed").increment(1);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            counter!("gateway_rate_limit_decisions_total", "decision" => "denied").increment(1);
        }
        decision
    }

    fn admit(&self, timestamps: &mut VecDeque<Instant>, now: Instant) -> RateLimitDecision {
        self.purge(timestamps, now);

        let used = timestamps.len() as u32;
        if used < self.max_requests {
            timestamps.push_back(now);
            RateLimitDecision {
                allowed: true,
                limit: self.max_requests,
                remaining: self.max_requests - used - 1,
                retry_after: Duration::ZERO,
            }
        } else {
            let retry_after = timestamps
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            RateLimitDecision {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                retry_after,
            }
        }
    }

    fn purge(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Evict clients with no timestamps left in their window. Returns how
    /// many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, timestamps| {
            self.purge(timestamps, now);
            !timestamps.is_empty()
        });
        let evicted = before.saturating_sub(self.windows.len());
        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing to sweep yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.sweep();
                        if evicted > 0 {
                            debug!(evicted, tracked = self.tracked_clients(), "Evicted idle rate-limit windows");
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            allowed_requests: self.allowed.load(Ordering::Relaxed),
            denied_requests: self.denied.load(Ordering::Relaxed),
            evicted_clients: self.evicted.load(Ordering::Relaxed),
            tracked_clients: self.tracked_clients(),
            max_requests: self.max_requests,
            window_ms: self.window.as_millis() as u64,
        }
    }
}

/// Shared state for [`rate_limit_middleware`]
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<SlidingWindowRateLimiter>,
    pub client_id_header: HeaderName,
}

impl RateLimitState {
    pub fn new(limiter: Arc<SlidingWindowRateLimiter>, client_id_header: &str) -> Self {
        let client_id_header = HeaderName::from_bytes(client_id_header.to_ascii_lowercase().as_bytes())
            .unwrap_or_else(|_| HeaderName::from_static("x-client-id"));
        Self {
            limiter,
            client_id_header,
        }
    }
}

/// Identify the caller: explicit header, then peer IP, then `"anonymous"`
pub fn client_identifier(request: &Request, header: &HeaderName) -> String {
    if let Some(id) = request
        .headers()
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return id.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string())
}

/// Refuse over-quota clients with 429; annotate admitted responses with
/// their remaining quota.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let client_id = client_identifier(&request, &state.client_id_header);
    let decision = state.limiter.check(&client_id);

    if !decision.allowed {
        let request_id = request_id_of(&request);
        warn!(
            client_id = %client_id,
            path = %request.uri().path(),
            retry_after_ms = decision.retry_after.as_millis() as u64,
            "Rate limit exceeded"
        );
        let window = humantime::format_duration(state.limiter.window()).to_string();
        let retry_after_secs = decision.retry_after.as_secs_f64().ceil().max(1.0) as u64;
        return GatewayError::RateLimitExceeded {
            client_id,
            limit: decision.limit,
            window,
            retry_after_secs,
        }
        .into_response_with_request_id(request_id.as_deref());
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    response
}
