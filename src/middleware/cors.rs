use axum::http::{HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_allowed_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_allowed_headers() -> Vec<String> {
    ["content-type", "authorization", "x-api-key", "x-client-id", "x-request-id"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

fn default_max_age() -> Duration {
    Duration::from_secs(3600)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorsConfig {
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default = "default_allowed_headers")]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default = "default_max_age", with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
            allowed_methods: default_allowed_methods(),
            allowed_headers: default_allowed_headers(),
            allow_credentials: false,
            max_age: default_max_age(),
        }
    }
}

impl CorsConfig {
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}

/// Build the tower-http CORS layer. Gateway tracing headers are exposed to
/// browser clients.
pub fn build_cors_layer(config: &CorsConfig) -> CorsLayer {
    let mut layer = CorsLayer::new()
        .max_age(config.max_age)
        .expose_headers([
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-gateway-instance-id"),
            HeaderName::from_static("x-gateway-service"),
        ]);

    if config.allows_any_origin() {
        layer = layer.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        layer = layer.allow_origin(origins);
    }

    let methods: Vec<Method> = config
        .allowed_methods
        .iter()
        .filter_map(|m| m.to_ascii_uppercase().parse().ok())
        .collect();
    layer = layer.allow_methods(methods);

    let headers: Vec<HeaderName> = config
        .allowed_headers
        .iter()
        .filter_map(|h| HeaderName::from_bytes(h.to_ascii_lowercase().as_bytes()).ok())
        .collect();
    layer = layer.allow_headers(headers);

    // tower-http rejects credentials combined with a wildcard origin
    if config.allow_credentials && !config.allows_any_origin() {
        layer = layer.allow_credentials(true);
    } else if config.allow_credentials {
        warn!("CORS allow_credentials ignored because allowed_origins contains '*'");
    }

    layer
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    fn app(config: &CorsConfig) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(build_cors_layer(config))
    }

    fn explicit_config() -> CorsConfig {
        CorsConfig {
            allowed_origins: vec!["https://app.example.com".to_string()],
            allow_credentials: true,
            ..Default::default()
        }
    }

    async fn get_with_origin(config: &CorsConfig, origin: &'static str) -> axum::response::Response {
        app(config)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("origin", origin)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_default_config_allows_any_origin() {
        let config = CorsConfig::default();
        assert!(config.allows_any_origin());

        let response = get_with_origin(&config, "https://anywhere.example").await;
        assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }

    #[tokio::test]
    async fn test_explicit_origin_is_echoed_with_credentials() {
        let config = explicit_config();
        assert!(!config.allows_any_origin());

        let response = get_with_origin(&config, "https://app.example.com").await;
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://app.example.com"
        );
        assert_eq!(
            response.headers().get("access-control-allow-credentials").unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn test_unlisted_origin_gets_no_grant() {
        let response = get_with_origin(&explicit_config(), "https://evil.example").await;
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_credentials_dropped_with_wildcard_origin() {
        let config = CorsConfig {
            allow_credentials: true,
            ..Default::default()
        };
        let response = get_with_origin(&config, "https://anywhere.example").await;
        assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }
}
