//! # Hot Path Benchmarks
//!
//! Instance selection, rate limit admission and route resolution run on
//! every proxied request.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use service_gateway::core::types::{InstanceDescriptor, ServiceInstance};
use service_gateway::load_balancing::{LoadBalancer, LoadBalancingStrategy};
use service_gateway::middleware::SlidingWindowRateLimiter;
use service_gateway::routing::{RouteDefinition, RouteTable};

fn create_instances(count: usize) -> Vec<Arc<ServiceInstance>> {
    (0..count)
        .map(|i| {
            let descriptor = InstanceDescriptor::new(
                format!("instance-{}", i),
                "bench-service",
                format!("http://10.0.0.{}:8080", i % 250 + 1),
            )
            .with_weight((i % 5 + 1) as f64);
            Arc::new(ServiceInstance::new("bench-service", descriptor))
        })
        .collect()
}

fn benchmark_instance_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("instance_selection");
    let strategies = [
        LoadBalancingStrategy::RoundRobin,
        LoadBalancingStrategy::LeastConnections,
        LoadBalancingStrategy::WeightedRoundRobin,
        LoadBalancingStrategy::Random,
    ];

    for count in [3usize, 16, 128] {
        let instances = create_instances(count);
        // a few unhealthy ones so the filter does real work
        for instance in instances.iter().step_by(4) {
            instance.set_healthy(false);
        }

        for strategy in strategies {
            let balancer = LoadBalancer::seeded(strategy, 42);
            group.throughput(Throughput::Elements(1));
            group.bench_with_input(
                BenchmarkId::new(strategy.as_str(), count),
                &instances,
                |b, instances| {
                    b.iter(|| black_box(balancer.select("bench-service", instances, None)));
                },
            );
        }
    }
    group.finish();
}

fn benchmark_rate_limit_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limit_admission");

    let limiter = SlidingWindowRateLimiter::new(u32::MAX, Duration::from_secs(60));
    group.bench_function("single_client", |b| {
        b.iter(|| black_box(limiter.check("tenant-a")));
    });

    let limiter = SlidingWindowRateLimiter::new(100, Duration::from_secs(60));
    let clients: Vec<String> = (0..1_000).map(|i| format!("client-{}", i)).collect();
    let mut next = 0usize;
    group.bench_function("many_clients_at_quota", |b| {
        b.iter(|| {
            next = (next + 1) % clients.len();
            black_box(limiter.check(&clients[next]))
        });
    });
    group.finish();
}

fn benchmark_route_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_resolution");
    let mut definitions: Vec<RouteDefinition> = (0..50)
        .map(|i| RouteDefinition::new(format!("/api/service-{}", i), format!("service-{}", i)))
        .collect();
    definitions.push(RouteDefinition::new("/", "frontend"));

    let Ok(table) = RouteTable::new(definitions) else {
        return;
    };
    for path in ["/api/service-7/orders/42", "/api/service-49", "/static/app.js"] {
        group.bench_with_input(BenchmarkId::from_parameter(path), &path, |b, path| {
            b.iter(|| black_box(table.resolve(path)));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_instance_selection,
    benchmark_rate_limit_admission,
    benchmark_route_resolution
);
criterion_main!(benches);
