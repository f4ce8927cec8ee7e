//! # Service Registry
//!
//! Owns the set of live instances per logical service name and the lifetime
//! of each instance's health prober.
//!
//! ## Concurrency
//! The per-service instance list sits behind one `DashMap` shard lock. A
//! registration or deregistration swaps the list entry while holding that
//! lock, so concurrent readers see an instance either fully present or not at
//! all. Readers copy out `Arc<ServiceInstance>` handles and release the lock
//! before doing anything slow.
//!
//! ## Prober ownership
//! Each registered instance owns a child of the registry's cancellation token.
//! Deregistering (or replacing) an instance cancels that token, which stops its
//! prober before it can write another health update. The instance itself is
//! only marked removed, so requests still holding it finish normally and give
//! back their connection slot.
//!
//! ## Circuit breakers
//! The registry owns the per-instance breakers keyed `service/instance-id`.
//! Replacing or deregistering an instance drops its breaker, so a
//! re-registered instance starts with a closed circuit.

use dashmap::DashMap;
use metrics::gauge;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{InstanceDescriptor, InstanceSnapshot, ServiceInstance};
use crate::discovery::prober::{HealthCheckConfig, HealthProbe, HealthProber, HttpHealthProbe};

/// Aggregate counts for `/health` and `/metrics`
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub active_connections: usize,
}

struct RegisteredInstance {
    instance: Arc<ServiceInstance>,
    cancel: CancellationToken,
    prober: JoinHandle<()>,
}

impl RegisteredInstance {
    fn retire(&self) {
        self.cancel.cancel();
        self.instance.mark_removed();
    }
}

pub struct ServiceRegistry {
    services: DashMap<String, Vec<RegisteredInstance>>,
    probe: Arc<dyn HealthProbe>,
    config: HealthCheckConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    shutdown: CancellationToken,
}

impl ServiceRegistry {
    /// Registry probing instances over HTTP
    pub fn new(config: HealthCheckConfig) -> GatewayResult<Self> {
        let probe = Arc::new(HttpHealthProbe::new(&config)?);
        Ok(Self::with_probe(config, probe))
    }

    /// Registry with a custom liveness check
    pub fn with_probe(config: HealthCheckConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            services: DashMap::new(),
            probe,
            config,
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Per-instance circuit breakers, cleared as instances come and go
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn health_check_config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Insert or replace (by id) an instance of `service_name` and start its
    /// prober. A replaced instance keeps its position in the service's list;
    /// its old prober is cancelled and its circuit breaker dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(
        &self,
        service_name: &str,
        descriptor: InstanceDescriptor,
    ) -> GatewayResult<Arc<ServiceInstance>> {
        descriptor.validate()?;
        if service_name.trim().is_empty() {
            return Err(GatewayError::invalid_request("service name cannot be empty"));
        }
        if let Some(named) = descriptor.service_name.as_deref() {
            if named != service_name {
                return Err(GatewayError::invalid_request(format!(
                    "descriptor names service '{}' but was registered under '{}'",
                    named, service_name
                )));
            }
        }

        let instance = Arc::new(ServiceInstance::new(service_name, descriptor));
        let cancel = self.shutdown.child_token();
        let prober = HealthProber::new(
            instance.clone(),
            self.probe.clone(),
            self.config.interval,
            cancel.clone(),
        )
        .spawn();

        let entry = RegisteredInstance {
            instance: instance.clone(),
            cancel,
            prober,
        };

        let replaced = {
            let mut instances = self.services.entry(service_name.to_string()).or_default();
            match instances.iter().position(|e| e.instance.id == instance.id) {
                Some(index) => Some(std::mem::replace(&mut instances[index], entry)),
                None => {
                    instances.push(entry);
                    None
                }
            }
        };

        match replaced {
            Some(old) => {
                old.retire();
                self.breakers.remove(&instance.key());
                info!(
                    service = service_name,
                    instance_id = %instance.id,
                    base_url = %instance.base_url,
                    "Instance re-registered"
                );
            }
            None => {
                info!(
                    service = service_name,
                    instance_id = %instance.id,
                    base_url = %instance.base_url,
                    weight = instance.weight,
                    "Instance registered"
                );
            }
        }

        self.publish_gauges();
        Ok(instance)
    }

    /// Remove an instance, cancel its prober and drop its circuit breaker.
    /// Returns the removed instance, or `None` when it was not registered.
    pub fn deregister(&self, service_name: &str, instance_id: &str) -> Option<Arc<ServiceInstance>> {
        let removed = {
            let mut instances = self.services.get_mut(service_name)?;
            let index = instances.iter().position(|e| e.instance.id == instance_id)?;
            instances.remove(index)
        };
        self.services.remove_if(service_name, |_, instances| instances.is_empty());

        removed.retire();
        self.breakers.remove(&removed.instance.key());
        info!(service = service_name, instance_id = instance_id, "Instance deregistered");
        self.publish_gauges();
        Some(removed.instance)
    }

    /// Instances of `service_name` whose last probe succeeded, in
    /// registration order. Unknown services yield an empty list.
    pub fn get_healthy_instances(&self, service_name: &str) -> Vec<Arc<ServiceInstance>> {
        self.services
            .get(service_name)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|e| e.instance.is_healthy())
                    .map(|e| e.instance.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_instances(&self, service_name: &str) -> Vec<Arc<ServiceInstance>> {
        self.services
            .get(service_name)
            .map(|instances| instances.iter().map(|e| e.instance.clone()).collect())
            .unwrap_or_default()
    }

    pub fn get_instance(&self, service_name: &str, instance_id: &str) -> Option<Arc<ServiceInstance>> {
        self.services.get(service_name).and_then(|instances| {
            instances
                .iter()
                .find(|e| e.instance.id == instance_id)
                .map(|e| e.instance.clone())
        })
    }

    /// Whether the prober task for an instance is still alive
    pub fn prober_running(&self, service_name: &str, instance_id: &str) -> Option<bool> {
        self.services.get(service_name).and_then(|instances| {
            instances
                .iter()
                .find(|e| e.instance.id == instance_id)
                .map(|e| !e.prober.is_finished())
        })
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshot of every service and its instances
    pub fn list_all(&self) -> BTreeMap<String, Vec<InstanceSnapshot>> {
        self.services
            .iter()
            .map(|entry| {
                let snapshots = entry.value().iter().map(|e| e.instance.snapshot()).collect();
                (entry.key().clone(), snapshots)
            })
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.services.iter() {
            stats.total_services += 1;
            for registered in entry.value() {
                stats.total_instances += 1;
                stats.active_connections += registered.instance.active_connections();
                if registered.instance.is_healthy() {
                    stats.healthy_instances += 1;
                } else {
                    stats.unhealthy_instances += 1;
                }
            }
        }
        stats
    }

    /// Cancel every prober. Instances stay listed but stop being probed.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Stopping all health probers");
            self.shutdown.cancel();
        }
    }

    fn publish_gauges(&self) {
        let stats = self.stats();
        gauge!("gateway_registered_services").set(stats.total_services as f64);
        gauge!("gateway_registered_instances").set(stats.total_instances as f64);
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
