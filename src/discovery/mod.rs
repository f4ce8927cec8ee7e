pub mod prober;
pub mod registry;

pub use prober::{HealthCheckConfig, HealthProbe, HealthProber, HttpHealthProbe, ProbeOutcome};
pub use registry::{RegistryStats, ServiceRegistry};
