//! # Core Types
//!
//! Data structures shared by the registry, the load balancer and the request
//! router.
//!
//! A [`ServiceInstance`] is created once per registration and shared as
//! `Arc<ServiceInstance>` between the registry, its health prober and any
//! in-flight proxied requests. Its identity fields are immutable; the runtime
//! fields (`healthy`, `active_connections`, `last_seen`, `removed`) are
//! atomics or locked cells, so concurrent probes and requests never lose
//! updates.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

use crate::core::error::{GatewayError, GatewayResult};

fn default_weight() -> f64 {
    1.0
}

/// Registration payload for one backend endpoint.
///
/// Accepts both snake_case and the camelCase spellings (`serviceName`,
/// `baseURL`) used by existing registration scripts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceDescriptor {
    /// Unique within the service; generated when omitted
    #[serde(default)]
    pub id: Option<String>,

    /// Logical service name; may instead be supplied by the caller
    #[serde(default, alias = "serviceName")]
    pub service_name: Option<String>,

    /// Base URL requests and probes are issued against
    #[serde(alias = "baseURL", alias = "baseUrl")]
    pub base_url: String,

    /// Relative weight for weighted selection
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Free-form labels such as version or region
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl InstanceDescriptor {
    pub fn new(id: impl Into<String>, service_name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            service_name: Some(service_name.into()),
            base_url: base_url.into(),
            weight: default_weight(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the descriptor before it reaches the registry.
    pub fn validate(&self) -> GatewayResult<()> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            GatewayError::invalid_request(format!("invalid base_url '{}': {}", self.base_url, e))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(GatewayError::invalid_request(format!(
                "base_url '{}' must use http or https",
                self.base_url
            )));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(GatewayError::invalid_request(format!(
                "weight must be a finite number >= 0, got {}",
                self.weight
            )));
        }
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(GatewayError::invalid_request("id cannot be empty"));
            }
        }
        if let Some(name) = &self.service_name {
            if name.trim().is_empty() {
                return Err(GatewayError::invalid_request("service_name cannot be empty"));
            }
        }
        Ok(())
    }
}

/// One addressable backend endpoint.
#[derive(Debug)]
pub struct ServiceInstance {
    pub id: String,
    pub service_name: String,
    pub base_url: String,
    pub weight: f64,
    pub metadata: BTreeMap<String, Value>,
    pub registered_at: DateTime<Utc>,

    healthy: AtomicBool,
    active_connections: AtomicUsize,
    last_seen: RwLock<Option<DateTime<Utc>>>,
    removed: AtomicBool,
}

impl ServiceInstance {
    /// Build an instance for `service_name` from a registration payload.
    ///
    /// New instances start healthy; their prober runs its first check right
    /// away and corrects the flag if the endpoint is down.
    pub fn new(service_name: impl Into<String>, descriptor: InstanceDescriptor) -> Self {
        Self {
            id: descriptor
                .id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            service_name: service_name.into(),
            base_url: descriptor.base_url.trim_end_matches('/').to_string(),
            weight: descriptor.weight,
            metadata: descriptor.metadata,
            registered_at: Utc::now(),
            healthy: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
            last_seen: RwLock::new(None),
            removed: AtomicBool::new(false),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Store the new health flag and return the previous one.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        *self.last_seen.read()
    }

    /// Record that a probe completed, whatever its outcome.
    pub fn touch(&self) {
        *self.last_seen.write() = Some(Utc::now());
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn increment_connections(&self) -> usize {
        self.active_connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement, never going below zero.
    pub fn decrement_connections(&self) -> usize {
        let previous = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Flag the instance as no longer registered. In-flight requests keep
    /// their `Arc` and still release their connection slot.
    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Key used for per-instance state kept outside the registry.
    pub fn key(&self) -> String {
        format!("{}/{}", self.service_name, self.id)
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            service_name: self.service_name.clone(),
            base_url: self.base_url.clone(),
            healthy: self.is_healthy(),
            weight: self.weight,
            active_connections: self.active_connections(),
            last_seen: self.last_seen(),
            registered_at: self.registered_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// Point-in-time, serializable view of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSnapshot {
    pub id: String,
    pub service_name: String,
    pub base_url: String,
    pub healthy: bool,
    pub weight: f64,
    pub active_connections: usize,
    pub last_seen: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
}

/// Holds one active-connection slot on an instance for as long as it lives.
///
/// The slot is released in `Drop`, so it is returned on every exit path:
/// success, error, early return, or the request future being dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    instance: Arc<ServiceInstance>,
}

impl ConnectionGuard {
    pub fn acquire(instance: Arc<ServiceInstance>) -> Self {
        instance.increment_connections();
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<ServiceInstance> {
        &self.instance
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.instance.decrement_connections();
    }
}
