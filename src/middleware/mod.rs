//! Inbound middleware, applied by the gateway in this order:
//! CORS, request id, access log, rate limiting, admin authentication.

pub mod auth;
pub mod cors;
pub mod rate_limiting;
pub mod request_logging;

use axum::extract::Request;

pub use auth::{admin_auth_middleware, AdminAuthState, AdminConfig};
pub use cors::{build_cors_layer, CorsConfig};
pub use rate_limiting::{
    client_identifier, rate_limit_middleware, RateLimitConfig, RateLimitDecision, RateLimitState,
    SlidingWindowRateLimiter,
};
pub use request_logging::access_log_middleware;

/// Header carrying the per-request correlation id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id assigned (or propagated) by the request-id layer
pub fn request_id_of(request: &Request) -> Option<String> {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
