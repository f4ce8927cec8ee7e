use axum::{
    extract::{ConnectInfo, MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use metrics::{counter, histogram};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

use crate::middleware::request_id_of;

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// One structured line per request, plus request count and latency metrics.
pub async fn access_log_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request_id_of(&request).unwrap_or_default();
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());
    // label by route template for admin endpoints so ids don't explode cardinality
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "proxy".to_string());

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();
    let class = status_class(status);

    histogram!("gateway_request_duration_seconds", "route" => route.clone())
        .record(latency.as_secs_f64());
    counter!("gateway_requests_total", "status" => class, "method" => method.to_string())
        .increment(1);

    let latency_ms = latency.as_secs_f64() * 1000.0;
    if status >= 500 {
        warn!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status,
            latency_ms,
            client = %client,
            "Request failed"
        );
    } else {
        info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status,
            latency_ms,
            client = %client,
            "Request completed"
        );
    }

    response
}
