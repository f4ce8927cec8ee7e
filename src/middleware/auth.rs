//! API-key guard for the administrative surface.
//!
//! Requests whose path falls under the privileged prefix must carry one of the
//! configured keys, either as `x-api-key` or as `Authorization: Bearer <key>`.
//! With no keys configured the guard is a pass-through.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::core::error::GatewayError;
use crate::middleware::request_id_of;

pub const API_KEY_HEADER: &str = "x-api-key";

fn default_privileged_prefix() -> String {
    "/admin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_privileged_prefix")]
    pub privileged_prefix: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            privileged_prefix: default_privileged_prefix(),
        }
    }
}

#[derive(Clone)]
pub struct AdminAuthState {
    api_keys: Arc<Vec<String>>,
    prefix: Arc<str>,
}

impl AdminAuthState {
    pub fn new(config: &AdminConfig) -> Self {
        if config.api_keys.is_empty() {
            warn!(
                prefix = %config.privileged_prefix,
                "No admin API keys configured, admin endpoints are unauthenticated"
            );
        }
        let prefix = config.privileged_prefix.trim_end_matches('/');
        Self {
            api_keys: Arc::new(config.api_keys.clone()),
            prefix: Arc::from(prefix),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    /// Segment-aware match: `/admin` covers `/admin/x` but not `/administer`.
    pub fn is_privileged(&self, path: &str) -> bool {
        if self.prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(&*self.prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    fn accepts(&self, presented: &str) -> bool {
        // evaluate every key so the comparison time is independent of which matched
        self.api_keys
            .iter()
            .fold(false, |found, key| constant_time_eq(key.as_bytes(), presented.as_bytes()) | found)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn presented_key(request: &Request) -> Option<&str> {
    let headers = request.headers();
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

pub async fn admin_auth_middleware(
    State(state): State<AdminAuthState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.enabled() || !state.is_privileged(request.uri().path()) {
        return next.run(request).await;
    }

    let verdict = match presented_key(&request) {
        Some(key) if state.accepts(key) => Ok(()),
        Some(_) => Err("invalid API key"),
        None => Err("missing API key"),
    };
    let reason = match verdict {
        Ok(()) => return next.run(request).await,
        Err(reason) => reason,
    };

    warn!(
        path = %request.uri().path(),
        method = %request.method(),
        reason,
        "Rejected admin request"
    );
    GatewayError::unauthorized(reason).into_response_with_request_id(request_id_of(&request).as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, http::StatusCode, middleware, routing::get, Router};
    use tower::ServiceExt;

    fn app(keys: Vec<&str>) -> Router {
        let state = AdminAuthState::new(&AdminConfig {
            api_keys: keys.into_iter().map(String::from).collect(),
            ..Default::default()
        });
        Router::new()
            .route("/admin/services", get(|| async { "ok" }))
            .route("/administer", get(|| async { "open" }))
            .layer(middleware::from_fn_with_state(state, admin_auth_middleware))
    }

    async fn status(app: Router, request: HttpRequest<Body>) -> StatusCode {
        app.oneshot(request).await.unwrap().status()
    }

    #[test]
    fn test_prefix_matching_is_segment_aware() {
        let state = AdminAuthState::new(&AdminConfig {
            api_keys: vec!["k".into()],
            ..Default::default()
        });
        assert!(state.is_privileged("/admin"));
        assert!(state.is_privileged("/admin/services"));
        assert!(!state.is_privileged("/administer"));
        assert!(!state.is_privileged("/api/admin"));
    }

    #[tokio::test]
    async fn test_missing_and_wrong_keys_are_rejected() {
        let req = HttpRequest::builder().uri("/admin/services").body(Body::empty()).unwrap();
        assert_eq!(status(app(vec!["secret"]), req).await, StatusCode::UNAUTHORIZED);

        let req = HttpRequest::builder()
            .uri("/admin/services")
            .header(API_KEY_HEADER, "nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(app(vec!["secret"]), req).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_key_in_either_header() {
        let req = HttpRequest::builder()
            .uri("/admin/services")
            .header(API_KEY_HEADER, "secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(app(vec!["other", "secret"]), req).await, StatusCode::OK);

        let req = HttpRequest::builder()
            .uri("/admin/services")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(app(vec!["secret"]), req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unprivileged_paths_and_disabled_guard_pass_through() {
        let req = HttpRequest::builder().uri("/administer").body(Body::empty()).unwrap();
        assert_eq!(status(app(vec!["secret"]), req).await, StatusCode::OK);

        let req = HttpRequest::builder().uri("/admin/services").body(Body::empty()).unwrap();
        assert_eq!(status(app(vec![]), req).await, StatusCode::OK);
    }
}
