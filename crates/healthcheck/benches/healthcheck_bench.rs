use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use healthcheck::{
    CycleTiming, HealthCheck, HealthCheckResult, HealthStatus, UsageCheck, UsageThresholds,
    aggregate, run_cycle,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

struct Canned(HealthStatus, String);

#[async_trait]
impl HealthCheck for Canned {
    async fn check(&self) -> HealthCheckResult {
        match self.0 {
            HealthStatus::Healthy => HealthCheckResult::healthy(&self.1, Duration::ZERO, "ok"),
            HealthStatus::Degraded => {
                HealthCheckResult::degraded(&self.1, Duration::ZERO, "slow", None)
            }
            HealthStatus::Unhealthy | HealthStatus::Unknown => {
                HealthCheckResult::unhealthy(&self.1, Duration::ZERO, "down", None)
            }
        }
    }

    fn name(&self) -> &str {
        &self.1
    }
}

fn checks(count: usize) -> Vec<Arc<dyn HealthCheck>> {
    (0..count)
        .map(|i| {
            let status = if i % 7 == 0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };
            Arc::new(Canned(status, format!("check-{}", i))) as Arc<dyn HealthCheck>
        })
        .collect()
}

fn aggregate_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate");

    for count in [3usize, 32, 256] {
        let results: Vec<HealthCheckResult> = (0..count)
            .map(|i| HealthCheckResult::healthy(format!("check-{}", i), Duration::ZERO, "ok"))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(count), &results, |b, results| {
            b.iter(|| black_box(aggregate(results)))
        });
    }

    group.finish();
}

fn cycle_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_cycle");
    group.sample_size(20);

    let rt = tokio::runtime::Runtime::new().unwrap();
    for count in [1usize, 10, 100] {
        let checks = checks(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &checks, |b, checks| {
            b.iter(|| {
                rt.block_on(async { black_box(run_cycle(checks, CycleTiming::default()).await) })
            })
        });
    }

    group.finish();
}

fn memory_check_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("usage_check");
    group.sample_size(10);

    let rt = tokio::runtime::Runtime::new().unwrap();
    let check = UsageCheck::memory("memory", UsageThresholds::default());
    group.bench_function("memory", |b| {
        b.iter(|| rt.block_on(async { black_box(check.check().await) }))
    });

    group.finish();
}

criterion_group!(benches, aggregate_benchmark, cycle_benchmark, memory_check_benchmark);
criterion_main!(benches);
