//! Dependency probes driven through the cycle runner with mocked backends.

use async_trait::async_trait;
use common::{Component, Error, Result};
use healthcheck::{
    CycleTiming, DependencyCheck, DependencyProbe, HealthCheck, HealthStatus, run_cycle,
};
use mockall::mock;
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Probe {}

    #[async_trait]
    impl DependencyProbe for Probe {
        async fn connect(&self) -> Result<()>;
        async fn exercise(&self) -> Result<()>;
    }
}

fn refused() -> Error {
    Error::dependency(Component::Store, "ping", "connection refused")
}

fn healthy_probe() -> MockProbe {
    let mut probe = MockProbe::new();
    probe.expect_connect().times(1).returning(|| Ok(()));
    probe.expect_exercise().times(1).returning(|| Ok(()));
    probe
}

#[tokio::test]
async fn test_unreachable_dependency_skips_exercise() {
    let mut probe = MockProbe::new();
    probe.expect_connect().times(1).returning(|| Err(refused()));
    probe.expect_exercise().never();

    let check = DependencyCheck::new("redis", Arc::new(probe));
    let result = check.check().await;

    assert_eq!(result.status, HealthStatus::Unhealthy);
    assert_eq!(result.name, "redis");
    assert!(result.error.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_failed_exercise_is_degraded() {
    let mut probe = MockProbe::new();
    probe.expect_connect().times(1).returning(|| Ok(()));
    probe
        .expect_exercise()
        .times(1)
        .returning(|| Err(Error::dependency(Component::Store, "write", "read-only replica")));

    let result = DependencyCheck::new("redis", Arc::new(probe)).check().await;
    assert_eq!(result.status, HealthStatus::Degraded);
}

#[tokio::test]
async fn test_cycle_over_store_cache_rpc() {
    let mut cache = MockProbe::new();
    cache.expect_connect().times(1).returning(|| Err(refused()));
    cache.expect_exercise().never();

    let checks: Vec<Arc<dyn HealthCheck>> = vec![
        Arc::new(DependencyCheck::new("database", Arc::new(healthy_probe()))),
        Arc::new(DependencyCheck::new("redis", Arc::new(cache))),
        Arc::new(DependencyCheck::new("grpc", Arc::new(healthy_probe()))),
    ];

    let timing = CycleTiming {
        check_timeout: Duration::from_secs(1),
        cycle_grace: Duration::from_millis(500),
    };
    let report = run_cycle(&checks, timing).await;

    assert_eq!(report.overall, HealthStatus::Degraded);
    let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        [HealthStatus::Healthy, HealthStatus::Unhealthy, HealthStatus::Healthy]
    );
}
