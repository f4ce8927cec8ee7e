//! # Load Balancer
//!
//! [`LoadBalancer::select`] is the single entry point used by the request
//! router. It filters the candidate set down to healthy instances, dispatches
//! to the requested [`LoadBalancingStrategy`] (or the configured default) and
//! returns `None` when nothing is eligible. An empty result means "no
//! capacity" and is turned into a 503 by the caller.
//!
//! Round-robin cursors live inside the balancer and are keyed by service name,
//! so they survive changes in the healthy subset between calls.

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::types::ServiceInstance;
use crate::load_balancing::strategies::{
    BalancingStrategy, LeastConnections, LoadBalancingStrategy, RandomSelection, RandomSource,
    RoundRobin, SeededRandom, ThreadRandom, WeightedRoundRobin,
};

/// Load balancer statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub default_strategy: LoadBalancingStrategy,
    pub total_selections: u64,
    pub failed_selections: u64,
    /// Selections per instance key (`service/instance-id`)
    pub selections_by_instance: BTreeMap<String, u64>,
}

pub struct LoadBalancer {
    default_strategy: LoadBalancingStrategy,
    round_robin: RoundRobin,
    least_connections: LeastConnections,
    weighted: WeightedRoundRobin,
    random: RandomSelection,
    total_selections: AtomicU64,
    failed_selections: AtomicU64,
    selections: DashMap<String, AtomicU64>,
}

impl LoadBalancer {
    /// Balancer backed by the thread-local RNG
    pub fn new(default_strategy: LoadBalancingStrategy) -> Self {
        Self::with_random_source(default_strategy, Arc::new(ThreadRandom))
    }

    /// Balancer whose randomized strategies replay a seeded sequence
    pub fn seeded(default_strategy: LoadBalancingStrategy, seed: u64) -> Self {
        Self::with_random_source(default_strategy, Arc::new(SeededRandom::new(seed)))
    }

    pub fn with_random_source(
        default_strategy: LoadBalancingStrategy,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            default_strategy,
            round_robin: RoundRobin::new(),
            least_connections: LeastConnections,
            weighted: WeightedRoundRobin::new(rng.clone()),
            random: RandomSelection::new(rng),
            total_selections: AtomicU64::new(0),
            failed_selections: AtomicU64::new(0),
            selections: DashMap::new(),
        }
    }

    pub fn default_strategy(&self) -> LoadBalancingStrategy {
        self.default_strategy
    }

    /// Pick one healthy instance of `service_name`.
    pub fn select(
        &self,
        service_name: &str,
        instances: &[Arc<ServiceInstance>],
        strategy: Option<LoadBalancingStrategy>,
    ) -> Option<Arc<ServiceInstance>> {
        let strategy = strategy.unwrap_or(self.default_strategy);
        let healthy: Vec<Arc<ServiceInstance>> = instances
            .iter()
            .filter(|instance| instance.is_healthy())
            .cloned()
            .collect();

        let selected = self
            .strategy(strategy)
            .select(service_name, &healthy)
            .cloned();

        match &selected {
            Some(instance) => {
                self.total_selections.fetch_add(1, Ordering::Relaxed);
                self.selections
                    .entry(instance.key())
                    .or_default()
                    .fetch_add(1, Ordering::Relaxed);
                counter!("gateway_lb_selections_total", "strategy" => strategy.as_str()).increment(1);
                debug!(
                    service = service_name,
                    instance_id = %instance.id,
                    strategy = strategy.as_str(),
                    candidates = healthy.len(),
                    "Selected instance"
                );
            }
            None => {
                self.failed_selections.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_lb_failed_selections_total", "strategy" => strategy.as_str()).increment(1);
                debug!(service = service_name, strategy = strategy.as_str(), "No eligible instance");
            }
        }
        selected
    }

    fn strategy(&self, strategy: LoadBalancingStrategy) -> &dyn BalancingStrategy {
        match strategy {
            LoadBalancingStrategy::RoundRobin => &self.round_robin,
            LoadBalancingStrategy::LeastConnections => &self.least_connections,
            LoadBalancingStrategy::WeightedRoundRobin => &self.weighted,
            LoadBalancingStrategy::Random => &self.random,
        }
    }

    /// Drop per-instance counters once an instance is deregistered
    pub fn forget_instance(&self, instance_key: &str) {
        self.selections.remove(instance_key);
    }

    pub fn stats(&self) -> LoadBalancerStats {
        LoadBalancerStats {
            default_strategy: self.default_strategy,
            total_selections: self.total_selections.load(Ordering::Relaxed),
            failed_selections: self.failed_selections.load(Ordering::Relaxed),
            selections_by_instance: self
                .selections
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }

    /// Reset cursors and counters
    pub fn reset(&self) {
        self.round_robin.reset();
        self.selections.clear();
        self.total_selections.store(0, Ordering::Relaxed);
        self.failed_selections.store(0, Ordering::Relaxed);
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancingStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::InstanceDescriptor;

    fn pool(n: usize) -> Vec<Arc<ServiceInstance>> {
        (0..n)
            .map(|i| {
                Arc::new(ServiceInstance::new(
                    "svc",
                    InstanceDescriptor::new(format!("i{}", i), "svc", format!("http://10.0.0.{}:80", i)),
                ))
            })
            .collect()
    }

    #[test]
    fn test_empty_or_all_unhealthy_returns_none() {
        let lb = LoadBalancer::default();
        assert!(lb.select("svc", &[], None).is_none());

        let instances = pool(2);
        instances.iter().for_each(|i| {
            i.set_healthy(false);
        });
        for strategy in [
            LoadBalancingStrategy::RoundRobin,
            LoadBalancingStrategy::LeastConnections,
            LoadBalancingStrategy::WeightedRoundRobin,
            LoadBalancingStrategy::Random,
        ] {
            assert!(lb.select("svc", &instances, Some(strategy)).is_none());
        }
        assert_eq!(lb.stats().failed_selections, 5);
    }

    #[test]
    fn test_unhealthy_instances_never_selected() {
        let lb = LoadBalancer::seeded(LoadBalancingStrategy::Random, 1);
        let instances = pool(3);
        instances[1].set_healthy(false);
        for _ in 0..200 {
            let picked = lb.select("svc", &instances, None).unwrap();
            assert_ne!(picked.id, "i1");
        }
    }

    #[test]
    fn test_default_strategy_is_round_robin() {
        let lb = LoadBalancer::default();
        assert_eq!(lb.default_strategy(), LoadBalancingStrategy::RoundRobin);
        let instances = pool(3);
        let ids: Vec<String> = (0..3)
            .map(|_| lb.select("svc", &instances, None).unwrap().id.clone())
            .collect();
        assert_eq!(ids, vec!["i0", "i1", "i2"]);
    }

    #[test]
    fn test_least_connections_minimum_holds() {
        let lb = LoadBalancer::default();
        let instances = pool(4);
        for (i, inst) in instances.iter().enumerate() {
            for _ in 0..(4 - i) {
                inst.increment_connections();
            }
        }
        let picked = lb
            .select("svc", &instances, Some(LoadBalancingStrategy::LeastConnections))
            .unwrap();
        assert!(instances
            .iter()
            .all(|other| picked.active_connections() <= other.active_connections()));
    }

    #[test]
    fn test_stats_and_reset() {
        let lb = LoadBalancer::default();
        let instances = pool(2);
        lb.select("svc", &instances, None);
        lb.select("svc", &instances, None);
        lb.select("svc", &instances, None);

        let stats = lb.stats();
        assert_eq!(stats.total_selections, 3);
        assert_eq!(stats.selections_by_instance["svc/i0"], 2);
        assert_eq!(stats.selections_by_instance["svc/i1"], 1);

        lb.forget_instance("svc/i0");
        assert!(!lb.stats().selections_by_instance.contains_key("svc/i0"));

        lb.reset();
        assert_eq!(lb.stats().total_selections, 0);
        assert_eq!(lb.select("svc", &instances, None).unwrap().id, "i0");
    }
}
