pub mod balancer;
pub mod strategies;

pub use balancer::{LoadBalancer, LoadBalancerStats};
pub use strategies::{LoadBalancingStrategy, RandomSource, SeededRandom, ThreadRandom};
