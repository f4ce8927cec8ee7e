//! Selection strategies.
//!
//! Each strategy picks one instance from a slice that the caller has already
//! filtered down to healthy instances. Randomized strategies draw from a
//! [`RandomSource`], which can be seeded for reproducible tests.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::types::ServiceInstance;

/// Named selection algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    #[default]
    #[serde(alias = "round_robin")]
    RoundRobin,
    #[serde(alias = "least_connections")]
    LeastConnections,
    #[serde(alias = "weighted_round_robin", alias = "weighted")]
    WeightedRoundRobin,
    Random,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::Random => "random",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(Self::RoundRobin),
            "least-connections" => Ok(Self::LeastConnections),
            "weighted-round-robin" | "weighted" => Ok(Self::WeightedRoundRobin),
            "random" => Ok(Self::Random),
            other => Err(format!("Unknown load balancing strategy: {}", other)),
        }
    }
}

/// Source of uniform randomness for the randomized strategies
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[0, 1)`
    fn next_f64(&self) -> f64;

    /// Uniform index in `[0, len)`; `len` is never zero
    fn next_index(&self, len: usize) -> usize;
}

/// Thread-local RNG, the default in production
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn next_index(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}

/// Deterministic RNG seeded from configuration
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }

    fn next_index(&self, len: usize) -> usize {
        self.rng.lock().gen_range(0..len)
    }
}

pub trait BalancingStrategy: Send + Sync {
    fn select<'a>(
        &self,
        service_name: &str,
        instances: &'a [Arc<ServiceInstance>],
    ) -> Option<&'a Arc<ServiceInstance>>;
}

/// Round robin with one cursor per service name.
///
/// The cursor advances on every selection and is reduced modulo the current
/// slice length, so a shrinking healthy set simply wraps.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_cursor(&self, service_name: &str) -> usize {
        if let Some(cursor) = self.cursors.get(service_name) {
            return cursor.fetch_add(1, Ordering::Relaxed);
        }
        self.cursors
            .entry(service_name.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.cursors.clear();
    }
}

impl BalancingStrategy for RoundRobin {
    fn select<'a>(
        &self,
        service_name: &str,
        instances: &'a [Arc<ServiceInstance>],
    ) -> Option<&'a Arc<ServiceInstance>> {
        if instances.is_empty() {
            return None;
        }
        let index = self.next_cursor(service_name) % instances.len();
        instances.get(index)
    }
}

/// Fewest active connections; ties go to the earliest instance in the slice.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl BalancingStrategy for LeastConnections {
    fn select<'a>(
        &self,
        _service_name: &str,
        instances: &'a [Arc<ServiceInstance>],
    ) -> Option<&'a Arc<ServiceInstance>> {
        let mut best: Option<(&'a Arc<ServiceInstance>, usize)> = None;
        for instance in instances {
            let connections = instance.active_connections();
            match best {
                Some((_, fewest)) if connections >= fewest => {}
                _ => best = Some((instance, connections)),
            }
        }
        best.map(|(instance, _)| instance)
    }
}

/// Cumulative-weight draw.
///
/// Draws `r` uniformly from `[0, total_weight)` and walks the slice
/// subtracting weights until `r` is no longer positive. Instances with a
/// weight of zero are never chosen; if every weight is zero the draw falls
/// back to a uniform pick.
pub struct WeightedRoundRobin {
    rng: Arc<dyn RandomSource>,
}

impl WeightedRoundRobin {
    pub fn new(rng: Arc<dyn RandomSource>) -> Self {
        Self { rng }
    }
}

impl BalancingStrategy for WeightedRoundRobin {
    fn select<'a>(
        &self,
        _service_name: &str,
        instances: &'a [Arc<ServiceInstance>],
    ) -> Option<&'a Arc<ServiceInstance>> {
        if instances.is_empty() {
            return None;
        }

        let total_weight: f64 = instances
            .iter()
            .map(|i| i.weight)
            .filter(|w| *w > 0.0)
            .sum();
        if total_weight <= 0.0 || !total_weight.is_finite() {
            return instances.get(self.rng.next_index(instances.len()));
        }

        let mut remaining = self.rng.next_f64() * total_weight;
        let mut last_eligible = None;
        for instance in instances.iter().filter(|i| i.weight > 0.0) {
            remaining -= instance.weight;
            if remaining <= 0.0 {
                return Some(instance);
            }
            last_eligible = Some(instance);
        }
        // Floating point rounding can leave a sliver above zero.
        last_eligible
    }
}

/// Uniform pick
pub struct RandomSelection {
    rng: Arc<dyn RandomSource>,
}

impl RandomSelection {
    pub fn new(rng: Arc<dyn RandomSource>) -> Self {
        Self { rng }
    }
}

impl BalancingStrategy for RandomSelection {
    fn select<'a>(
        &self,
        _service_name: &str,
        instances: &'a [Arc<ServiceInstance>],
    ) -> Option<&'a Arc<ServiceInstance>> {
        if instances.is_empty() {
            return None;
        }
        instances.get(self.rng.next_index(instances.len()))
    }
}
