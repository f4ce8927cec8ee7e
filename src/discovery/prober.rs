//! # Health Probing
//!
//! Every registered instance gets exactly one [`HealthProber`] task. The task
//! probes immediately, then once per interval, and writes the outcome into the
//! instance it owns:
//!
//! - `healthy` becomes `true` only for a response with a 2xx status
//! - `last_seen` is refreshed after every completed probe, pass or fail
//! - timeouts and transport errors count as unhealthy and are never fatal
//!
//! Only transitions are logged, so a dead instance does not flood the logs
//! every interval. The probe call is wrapped in `tokio::time::timeout`, which
//! drops the in-flight request when the deadline passes.

use async_trait::async_trait;
use metrics::counter;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceInstance;

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_path() -> String {
    "/health".to_string()
}

/// Probe schedule and request shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    /// Time between probes of one instance
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound on a single probe
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Path appended to the instance base URL
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            timeout: default_timeout(),
            path: default_path(),
        }
    }
}

/// Result of a single liveness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy { reason: String },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Liveness check against one instance
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, instance: &ServiceInstance) -> ProbeOutcome;
}

/// `GET {base_url}{path}` with a hard deadline
pub struct HttpHealthProbe {
    client: HttpClient,
    path: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(config: &HealthCheckConfig) -> GatewayResult<Self> {
        let client = HttpClient::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| GatewayError::HttpClient {
                message: format!("Failed to build health probe client: {}", e),
            })?;

        let path = if config.path.starts_with('/') {
            config.path.clone()
        } else {
            format!("/{}", config.path)
        };

        Ok(Self {
            client,
            path,
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, instance: &ServiceInstance) -> ProbeOutcome {
        let url = format!("{}{}", instance.base_url, self.path);

        match timeout(self.timeout, self.client.get(&url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(Ok(response)) => ProbeOutcome::Unhealthy {
                reason: format!("status {}", response.status().as_u16()),
            },
            Ok(Err(e)) => ProbeOutcome::Unhealthy {
                reason: e.to_string(),
            },
            Err(_) => ProbeOutcome::Unhealthy {
                reason: format!("timed out after {}ms", self.timeout.as_millis()),
            },
        }
    }
}

/// Write a probe outcome into the instance, logging only on a change.
/// Retired instances are left untouched.
pub fn apply_outcome(instance: &ServiceInstance, outcome: &ProbeOutcome) {
    if instance.is_removed() {
        return;
    }
    instance.touch();
    let healthy = outcome.is_healthy();
    let was_healthy = instance.set_healthy(healthy);

    match (was_healthy, outcome) {
        (true, ProbeOutcome::Unhealthy { reason }) => {
            counter!("gateway_health_transitions_total", "to" => "unhealthy").increment(1);
            warn!(
                service = %instance.service_name,
                instance_id = %instance.id,
                base_url = %instance.base_url,
                reason = %reason,
                "Instance became unhealthy"
            );
        }
        (false, ProbeOutcome::Healthy) => {
            counter!("gateway_health_transitions_total", "to" => "healthy").increment(1);
            info!(
                service = %instance.service_name,
                instance_id = %instance.id,
                base_url = %instance.base_url,
                "Instance recovered"
            );
        }
        _ => {}
    }
}

/// Periodic prober bound to one instance
pub struct HealthProber {
    instance: Arc<ServiceInstance>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    cancel: CancellationToken,
}

impl HealthProber {
    pub fn new(
        instance: Arc<ServiceInstance>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instance,
            probe,
            // tokio's interval panics on a zero period
            interval: interval.max(Duration::from_millis(1)),
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            service = %self.instance.service_name,
            instance_id = %self.instance.id,
            interval_ms = self.interval.as_millis() as u64,
            "Health prober started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                outcome = self.probe.check(&self.instance) => outcome,
            };

            // A deregistration racing the probe must not write to the instance.
            if self.cancel.is_cancelled() {
                break;
            }
            apply_outcome(&self.instance, &outcome);
        }

        debug!(
            service = %self.instance.service_name,
            instance_id = %self.instance.id,
            "Health prober stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::InstanceDescriptor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Switch {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for Switch {
        async fn check(&self, _instance: &ServiceInstance) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                ProbeOutcome::Healthy
            } else {
                ProbeOutcome::Unhealthy {
                    reason: "switched off".to_string(),
                }
            }
        }
    }

    fn instance(base_url: &str) -> Arc<ServiceInstance> {
        Arc::new(ServiceInstance::new(
            "svc",
            InstanceDescriptor::new("a", "svc", base_url),
        ))
    }

    #[test]
    fn test_apply_outcome_updates_flags() {
        let inst = instance("http://127.0.0.1:1");
        apply_outcome(
            &inst,
            &ProbeOutcome::Unhealthy {
                reason: "x".to_string(),
            },
        );
        assert!(!inst.is_healthy());
        assert!(inst.last_seen().is_some());

        apply_outcome(&inst, &ProbeOutcome::Healthy);
        assert!(inst.is_healthy());
    }

    #[test]
    fn test_apply_outcome_ignores_removed_instance() {
        let inst = instance("http://127.0.0.1:1");
        inst.mark_removed();
        apply_outcome(
            &inst,
            &ProbeOutcome::Unhealthy {
                reason: "late".to_string(),
            },
        );
        assert!(inst.is_healthy());
        assert!(inst.last_seen().is_none());
    }

    #[tokio::test]
    async fn test_http_probe_success_and_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let probe = HttpHealthProbe::new(&HealthCheckConfig::default()).unwrap();
        assert_eq!(probe.check(&instance(&server.uri())).await, ProbeOutcome::Healthy);

        let failing = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&failing)
            .await;
        let outcome = probe.check(&instance(&failing.uri())).await;
        assert_eq!(
            outcome,
            ProbeOutcome::Unhealthy {
                reason: "status 503".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_http_probe_enforces_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let config = HealthCheckConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let probe = HttpHealthProbe::new(&config).unwrap();
        let started = std::time::Instant::now();
        let outcome = probe.check(&instance(&server.uri())).await;
        assert!(!outcome.is_healthy());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused_is_unhealthy() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HttpHealthProbe::new(&HealthCheckConfig::default()).unwrap();
        let outcome = probe.check(&instance(&format!("http://{}", addr))).await;
        assert!(!outcome.is_healthy());
    }

    #[tokio::test]
    async fn test_prober_flips_health_and_stops_on_cancel() {
        let inst = instance("http://127.0.0.1:1");
        let switch = Arc::new(Switch {
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let handle = HealthProber::new(
            inst.clone(),
            switch.clone(),
            Duration::from_millis(20),
            cancel.clone(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(inst.is_healthy());
        assert!(switch.calls.load(Ordering::SeqCst) >= 1);

        switch.healthy.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!inst.is_healthy());

        cancel.cancel();
        handle.await.unwrap();

        let calls = switch.calls.load(Ordering::SeqCst);
        switch.healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(switch.calls.load(Ordering::SeqCst), calls);
        assert!(!inst.is_healthy());
    }
}
