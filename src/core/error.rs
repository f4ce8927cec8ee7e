//! # Error Handling
//!
//! Every failure the gateway can produce on the request path is a variant of
//! [`GatewayError`]. Variants map onto HTTP status codes through
//! [`GatewayError::status_code`] and render themselves as JSON through the
//! `IntoResponse` implementation, so handlers can simply return
//! `GatewayResult<T>` and let Axum turn errors into responses.
//!
//! ## Failure taxonomy
//!
//! | Variant               | Status | Notes                                              |
//! |-----------------------|--------|----------------------------------------------------|
//! | `NoHealthyInstances`  | 503    | registry had nothing healthy for the service       |
//! | `SelectionFailed`     | 503    | balancer found nothing after filtering             |
//! | `CircuitOpen`         | 503    | fail-fast, no network call was attempted           |
//! | `ProxyTransport`      | 502    | connect/timeout/DNS failure talking to an instance |
//! | `RateLimitExceeded`   | 429    | never touches registry or health state             |
//! | `UnknownRoute`        | 404    | body is `{error, path, method}`                    |
//! | `Internal`            | 500    | unexpected failures in the handling path           |
//!
//! Registry and prober failures never surface here; a failed probe only flips
//! the instance's `healthy` flag.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::convert::Infallible;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors produced while handling a request or configuring the gateway
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// The registry holds no healthy instance for the service
    #[error("No healthy instances available for service '{service}'")]
    NoHealthyInstances { service: String },

    /// The load balancer returned nothing for a non-empty healthy set
    #[error("Load balancer could not select an instance for service '{service}'")]
    SelectionFailed { service: String },

    /// The selected instance's breaker is open and its retry time has not passed
    #[error("Circuit breaker open for instance '{instance_id}' of service '{service}'")]
    CircuitOpen { service: String, instance_id: String },

    /// Transport-level failure while proxying (connection refused, timeout, DNS)
    #[error("Upstream '{instance_id}' of service '{service}' failed: {message}")]
    ProxyTransport {
        service: String,
        instance_id: String,
        message: String,
    },

    /// Client exceeded its sliding-window quota
    #[error("Rate limit exceeded for client '{client_id}': {limit} requests per {window}")]
    RateLimitExceeded {
        client_id: String,
        limit: u32,
        window: String,
        retry_after_secs: u64,
    },

    /// No route prefix matched the inbound path
    #[error("No route for {method} {path}")]
    UnknownRoute { method: String, path: String },

    /// Missing or invalid credentials on a privileged path
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// Malformed admin payloads and similar client mistakes
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Inbound body larger than the configured limit
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// A resource addressed by the admin API does not exist
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Invalid configuration values or unreadable config files
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Unexpected failures in the handling path
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (binding listeners, reading files)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client construction errors
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn invalid_request<S: Into<String>>(reason: S) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(reason: S) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn no_healthy_instances<S: Into<String>>(service: S) -> Self {
        Self::NoHealthyInstances {
            service: service.into(),
        }
    }

    pub fn unknown_route<M: Into<String>, P: Into<String>>(method: M, path: P) -> Self {
        Self::UnknownRoute {
            method: method.into(),
            path: path.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoHealthyInstances { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::SelectionFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ProxyTransport { .. } => StatusCode::BAD_GATEWAY,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UnknownRoute { .. } => StatusCode::NOT_FOUND,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::HttpClient { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client may reasonably retry the same request later.
    ///
    /// The gateway itself never retries; this is advertised to callers only.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoHealthyInstances { .. }
                | Self::SelectionFailed { .. }
                | Self::CircuitOpen { .. }
                | Self::ProxyTransport { .. }
                | Self::RateLimitExceeded { .. }
        )
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NoHealthyInstances { .. } => "no_healthy_instances",
            Self::SelectionFailed { .. } => "selection_failed",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ProxyTransport { .. } => "proxy_transport_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::UnknownRoute { .. } => "unknown_route",
            Self::Unauthorized { .. } => "unauthorized",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::NotFound { .. } => "not_found",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }

    /// JSON body for this error, optionally tagged with the request id.
    pub fn to_json(&self, request_id: Option<&str>) -> Value {
        let mut body = match self {
            // Unmatched routes keep the flat shape clients already parse.
            Self::UnknownRoute { method, path } => json!({
                "error": "Not Found",
                "path": path,
                "method": method,
            }),
            _ => json!({
                "error": {
                    "code": self.status_code().as_u16(),
                    "message": self.to_string(),
                    "type": self.error_type(),
                    "retryable": self.is_retryable(),
                }
            }),
        };

        if let (Some(id), Some(map)) = (request_id, body.as_object_mut()) {
            map.insert("request_id".to_string(), Value::String(id.to_string()));
        }
        body
    }

    /// Render the error as a response carrying the given request id.
    pub fn into_response_with_request_id(self, request_id: Option<&str>) -> Response {
        let status = self.status_code();
        let body = self.to_json(request_id);
        let mut response = (status, Json(body)).into_response();

        if let Self::RateLimitExceeded {
            retry_after_secs, ..
        } = &self
        {
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                HeaderValue::from(*retry_after_secs),
            );
        }
        response
    }
}

impl From<Infallible> for GatewayError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

/// Errors returned straight from handlers render without a request id; the
/// gateway middleware paths use [`GatewayError::into_response_with_request_id`].
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_with_request_id(None)
    }
}

/// Convenience macro for creating internal errors
///
/// Usage: `internal_error!("Failed to process request: {}", request_id)`
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::internal(format!($($arg)*))
    };
}

/// Convenience macro for creating configuration errors
///
/// Usage: `config_error!("Invalid port: {}", port)`
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::config(format!($($arg)*))
    };
}
