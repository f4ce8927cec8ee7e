//! # Service Gateway - Core Library Crate
//!
//! A single-ingress request gateway. It keeps a live registry of backend
//! service instances, probes each one for health, load-balances requests
//! across the healthy ones, isolates failing instances behind circuit
//! breakers, enforces per-client sliding-window rate limits and proxies
//! requests while attaching tracing headers.
//!
//! Request flow:
//!
//! ```text
//! inbound request
//!   -> middleware (CORS, request id, access log, rate limit, admin auth)
//!   -> RouteTable::resolve (path prefix -> service)
//!   -> RequestRouter::route_request
//!        -> ServiceRegistry::get_healthy_instances
//!        -> LoadBalancer::select
//!        -> CircuitBreaker::execute (per instance)
//!        -> outbound call, response relayed with gateway headers
//! ```

/// Error taxonomy, configuration, instance types and the circuit breaker
pub mod core;

/// Service registry and per-instance health probers
pub mod discovery;

/// Composition of everything into an axum application
pub mod gateway;

/// Instance selection strategies
pub mod load_balancing;

/// Inbound middleware: CORS, access log, rate limiting, admin auth
pub mod middleware;

/// Structured logging and Prometheus exposition
pub mod observability;

/// Prefix routing and the proxy hot path
pub mod routing;

pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
pub use core::types::{InstanceDescriptor, ServiceInstance};
pub use discovery::ServiceRegistry;
pub use gateway::{GatewayServer, GatewayState};
pub use load_balancing::{LoadBalancer, LoadBalancingStrategy};
pub use routing::{ProxyRequest, ProxyResponse, RequestRouter};
