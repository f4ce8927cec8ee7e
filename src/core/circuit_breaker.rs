//! Circuit Breaker Implementation
//!
//! Isolates a failing downstream so the gateway stops sending it traffic for a
//! while. One breaker exists per service instance, looked up by the instance
//! key in a [`CircuitBreakerRegistry`].
//!
//! ## States:
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls fail immediately with [`CircuitBreakerError::Open`] until
//!   `timeout` has elapsed since the circuit opened
//! - **HalfOpen**: exactly one call is admitted as a probe; success closes the
//!   circuit and zeroes the counter, failure re-opens it with a fresh timeout
//!
//! The breaker never retries. [`CircuitBreaker::execute`] only decides whether
//! an attempt is made and records its outcome; the operation's own result or
//! error is handed back unchanged.

use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use dashmap::DashMap;

/// Outcome of a guarded call that did not produce a value
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Rejected without invoking the operation
    #[error("Circuit breaker '{name}' is open, retry in {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The operation ran and failed; the error is passed through untouched
    #[error(transparent)]
    Operation(E),
}

/// Circuit breaker state machine
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerState {
    /// Normal operation; tracks consecutive failures
    Closed { failure_count: u32 },

    /// Failing fast until `next_attempt_at`
    Open { opened_at: Instant, next_attempt_at: Instant },

    /// Waiting on (or about to admit) the single probe call
    HalfOpen { probe_in_flight: bool },
}

impl CircuitBreakerState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Closed { .. } => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen { .. } => "half_open",
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_failures() -> u32 {
    5
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Wrap proxied calls in a per-instance breaker
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Consecutive failures before opening the circuit
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// How long the circuit stays open before admitting a probe
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_failures: default_max_failures(),
            timeout: default_timeout(),
        }
    }
}

/// Metrics collected by the circuit breaker
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    /// Calls refused without touching the network
    pub rejected_requests: AtomicU64,
    pub circuit_opened_count: AtomicU64,
    pub circuit_closed_count: AtomicU64,
}

impl CircuitBreakerMetrics {
    pub fn snapshot(&self) -> CircuitBreakerMetricsSnapshot {
        CircuitBreakerMetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            circuit_opened_count: self.circuit_opened_count.load(Ordering::Relaxed),
            circuit_closed_count: self.circuit_closed_count.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of circuit breaker metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerMetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub circuit_opened_count: u64,
    pub circuit_closed_count: u64,
}

/// Serializable view used by the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: String,
    pub failure_count: u32,
    /// Milliseconds until an open circuit admits its probe
    pub retry_after_ms: Option<u64>,
    pub metrics: CircuitBreakerMetricsSnapshot,
}

/// Ticket for one admitted call. Dropping it without settling (the caller's
/// future was cancelled) frees the half-open probe slot again.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.record_success(self.probe);
        } else {
            self.breaker.record_failure(self.probe);
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Per-dependency failure isolation.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    metrics: Arc<CircuitBreakerMetrics>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitBreakerState::Closed { failure_count: 0 }),
            metrics: Arc::new(CircuitBreakerMetrics::default()),
        }
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Run `operation` if the circuit admits it.
    ///
    /// `Err` results count as failures, `Ok` as successes. When the circuit
    /// refuses the call the operation is never invoked.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().map_err(|retry_after| CircuitBreakerError::Open {
            name: self.name.clone(),
            retry_after,
        })?;

        match operation().await {
            Ok(value) => {
                admission.settle(true);
                Ok(value)
            }
            Err(err) => {
                admission.settle(false);
                Err(CircuitBreakerError::Operation(err))
            }
        }
    }

    /// Decide whether a call may proceed. On refusal returns the time left
    /// until the next probe is allowed.
    fn admit(&self) -> Result<Admission<'_>, Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let probe = match *state {
            CircuitBreakerState::Closed { .. } => false,
            CircuitBreakerState::Open { next_attempt_at, .. } => {
                if now < next_attempt_at {
                    self.metrics.rejected_requests.fetch_add(1, Ordering::Relaxed);
                    counter!("gateway_circuit_breaker_rejections_total").increment(1);
                    return Err(next_attempt_at - now);
                }
                *state = CircuitBreakerState::HalfOpen {
                    probe_in_flight: true,
                };
                info!(breaker = %self.name, "Circuit half-open, admitting probe");
                true
            }
            CircuitBreakerState::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    self.metrics.rejected_requests.fetch_add(1, Ordering::Relaxed);
                    counter!("gateway_circuit_breaker_rejections_total").increment(1);
                    return Err(Duration::ZERO);
                }
                *state = CircuitBreakerState::HalfOpen {
                    probe_in_flight: true,
                };
                true
            }
        };

        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        Ok(Admission {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn record_success(&self, probe: bool) {
        let mut state = self.state.lock();
        self.metrics.successful_requests.fetch_add(1, Ordering::Relaxed);

        match *state {
            CircuitBreakerState::Closed { .. } => {
                *state = CircuitBreakerState::Closed { failure_count: 0 };
            }
            CircuitBreakerState::HalfOpen { .. } if probe => {
                *state = CircuitBreakerState::Closed { failure_count: 0 };
                self.metrics.circuit_closed_count.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_circuit_breaker_transitions_total", "to" => "closed").increment(1);
                info!(breaker = %self.name, "Circuit closed after successful probe");
            }
            // Late results from calls admitted before the circuit opened.
            _ => {}
        }
    }

    fn record_failure(&self, probe: bool) {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);

        match *state {
            CircuitBreakerState::Closed { failure_count } => {
                let failure_count = failure_count + 1;
                if failure_count >= self.config.max_failures {
                    *state = self.open_state(now);
                    self.metrics.circuit_opened_count.fetch_add(1, Ordering::Relaxed);
                    counter!("gateway_circuit_breaker_transitions_total", "to" => "open").increment(1);
                    warn!(
                        breaker = %self.name,
                        failures = failure_count,
                        timeout_ms = self.config.timeout.as_millis() as u64,
                        "Circuit opened"
                    );
                } else {
                    *state = CircuitBreakerState::Closed { failure_count };
                }
            }
            CircuitBreakerState::HalfOpen { .. } if probe => {
                *state = self.open_state(now);
                self.metrics.circuit_opened_count.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_circuit_breaker_transitions_total", "to" => "open").increment(1);
                warn!(breaker = %self.name, "Probe failed, circuit re-opened");
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        let mut state = self.state.lock();
        if let CircuitBreakerState::HalfOpen { .. } = *state {
            *state = CircuitBreakerState::HalfOpen {
                probe_in_flight: false,
            };
        }
    }

    fn open_state(&self, now: Instant) -> CircuitBreakerState {
        CircuitBreakerState::Open {
            opened_at: now,
            next_attempt_at: now + self.config.timeout,
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.state.lock().clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<CircuitBreakerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Manually force the circuit breaker to open (for admin override)
    pub fn force_open(&self) {
        *self.state.lock() = self.open_state(Instant::now());
        self.metrics.circuit_opened_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Manually close the circuit and zero its failure counter
    pub fn force_close(&self) {
        *self.state.lock() = CircuitBreakerState::Closed { failure_count: 0 };
        self.metrics.circuit_closed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state();
        let now = Instant::now();
        let (failure_count, retry_after_ms) = match &state {
            CircuitBreakerState::Closed { failure_count } => (*failure_count, None),
            CircuitBreakerState::Open { next_attempt_at, .. } => (
                self.config.max_failures,
                Some(next_attempt_at.saturating_duration_since(now).as_millis() as u64),
            ),
            CircuitBreakerState::HalfOpen { .. } => (self.config.max_failures, Some(0)),
        };

        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: state.label().to_string(),
            failure_count,
            retry_after_ms,
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Circuit breakers keyed by instance
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a circuit breaker for the given name
    pub fn get_or_create(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.value().clone())
    }

    /// All breakers, sorted by name
    pub fn get_all(&self) -> Vec<Arc<CircuitBreaker>> {
        let mut all: Vec<_> = self.breakers.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, breaker)| breaker)
    }

    /// Number of breakers currently refusing calls
    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| matches!(entry.value().state(), CircuitBreakerState::Open { .. }))
            .count()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(max_failures: u32, timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            max_failures,
            timeout,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, CircuitBreakerError<&'static str>> {
        cb.execute(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[tokio::test]
    async fn test_circuit_breaker_initial_state() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.state(), CircuitBreakerState::Closed { failure_count: 0 });
        assert_eq!(cb.config().max_failures, 5);
        assert_eq!(cb.config().timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_results_pass_through_unchanged() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        match fail(&cb).await {
            Err(CircuitBreakerError::Operation(e)) => assert_eq!(e, "boom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures_and_fails_fast() {
        let cb = CircuitBreaker::new("test", config(3, Duration::from_secs(60)));
        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, Err(CircuitBreakerError::Operation(_))));
        }
        assert!(matches!(cb.state(), CircuitBreakerState::Open { .. }));

        let calls = AtomicUsize::new(0);
        let result = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.metrics().snapshot().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let cb = CircuitBreaker::new("test", config(3, Duration::from_secs(60)));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitBreakerState::Closed { failure_count: 2 });
    }

    #[tokio::test]
    async fn test_probe_admitted_after_timeout_and_closes_on_success() {
        let cb = CircuitBreaker::new("test", config(2, Duration::from_millis(50)));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert!(matches!(succeed(&cb).await, Err(CircuitBreakerError::Open { .. })));

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitBreakerState::Closed { failure_count: 0 });
        assert_eq!(cb.metrics().snapshot().circuit_closed_count, 1);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_with_fresh_timeout() {
        let cb = CircuitBreaker::new("test", config(1, Duration::from_millis(50)));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(matches!(fail(&cb).await, Err(CircuitBreakerError::Operation(_))));
        assert!(matches!(cb.state(), CircuitBreakerState::Open { .. }));
        assert!(matches!(succeed(&cb).await, Err(CircuitBreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn test_single_probe_while_half_open() {
        let cb = Arc::new(CircuitBreaker::new("test", config(1, Duration::from_millis(20))));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &'static str>(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen { probe_in_flight: true });
        assert!(matches!(succeed(&cb).await, Err(CircuitBreakerError::Open { .. })));

        release_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(cb.state(), CircuitBreakerState::Closed { failure_count: 0 });
    }

    #[tokio::test]
    async fn test_cancelled_probe_frees_slot() {
        let cb = CircuitBreaker::new("test", config(1, Duration::from_millis(10)));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let pending = cb.execute(|| std::future::pending::<Result<(), &'static str>>());
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen { probe_in_flight: false });
        assert!(succeed(&cb).await.is_ok());
    }

    #[tokio::test]
    async fn test_manual_override_and_snapshot() {
        let cb = CircuitBreaker::with_defaults("svc/a");
        cb.force_open();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, "open");
        assert!(snapshot.retry_after_ms.unwrap() > 0);

        cb.force_close();
        assert_eq!(cb.snapshot().state, "closed");
    }

    #[test]
    fn test_circuit_breaker_registry() {
        let registry = CircuitBreakerRegistry::new();
        let config = CircuitBreakerConfig::default();

        let cb1 = registry.get_or_create("svc/a", &config);
        let cb2 = registry.get_or_create("svc/a", &config);
        let cb3 = registry.get_or_create("svc/b", &config);

        assert!(Arc::ptr_eq(&cb1, &cb2));
        assert_eq!(cb3.name(), "svc/b");
        assert_eq!(registry.len(), 2);

        cb3.force_open();
        assert_eq!(registry.open_count(), 1);

        assert!(registry.remove("svc/a").is_some());
        assert!(registry.get("svc/a").is_none());
        assert_eq!(registry.get_all().len(), 1);
    }

    #[test]
    fn test_config_deserializes_humantime() {
        let cfg: CircuitBreakerConfig =
            serde_yaml::from_str("max_failures: 3\ntimeout: 10s\n").unwrap();
        assert_eq!(cfg.max_failures, 3);
        assert_eq!(cfg.timeout, Duration::from_secs(10));
        assert!(cfg.enabled);
    }
}
