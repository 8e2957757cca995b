//! Concurrent execution of one health check cycle.

use crate::checkers::HealthCheck;
use crate::types::{CycleReport, HealthCheckResult, aggregate};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, warn};

/// Timing for one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleTiming {
    /// Default per-check timeout
    pub check_timeout: Duration,
    /// Extra time on top of `check_timeout` before the cycle gives up on
    /// stragglers
    pub cycle_grace: Duration,
}

impl Default for CycleTiming {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
            cycle_grace: Duration::from_secs(1),
        }
    }
}

impl CycleTiming {
    pub fn deadline(&self) -> Duration {
        self.check_timeout + self.cycle_grace
    }
}

/// Run every check concurrently and aggregate what comes back in time.
///
/// Each check runs under its own timeout and reports through a fan-in
/// channel. Checks still running at the cycle deadline are aborted and
/// listed in [`CycleReport::missing`].
pub async fn run_cycle(checks: &[Arc<dyn HealthCheck>], timing: CycleTiming) -> CycleReport {
    let started = Instant::now();
    let deadline = started + timing.deadline();
    let (tx, mut rx) = mpsc::channel::<(usize, HealthCheckResult)>(checks.len().max(1));

    let mut tasks = JoinSet::new();
    for (index, check) in checks.iter().enumerate() {
        let check = check.clone();
        let tx = tx.clone();
        let limit = check.timeout().unwrap_or(timing.check_timeout);
        tasks.spawn(async move {
            let result = match timeout(limit, check.check()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        check = check.name(),
                        timeout_ms = limit.as_millis() as u64,
                        "Health check timed out"
                    );
                    HealthCheckResult::timed_out(check.name(), limit)
                }
            };
            // Receiver is gone once the cycle deadline passed
            let _ = tx.send((index, result)).await;
        });
    }
    drop(tx);

    let mut collected: Vec<Option<HealthCheckResult>> = vec![None; checks.len()];
    loop {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((index, result))) => collected[index] = Some(result),
            Ok(None) => break,
            Err(_) => {
                warn!(
                    deadline_ms = timing.deadline().as_millis() as u64,
                    "Health check cycle deadline reached"
                );
                break;
            }
        }
    }
    tasks.abort_all();

    let mut results = Vec::with_capacity(checks.len());
    let mut missing = Vec::new();
    for (check, slot) in checks.iter().zip(collected) {
        match slot {
            Some(result) => results.push(result),
            None => {
                warn!(check = check.name(), "Health check missing from cycle");
                missing.push(check.name().to_string());
            }
        }
    }

    let overall = aggregate(&results);
    let duration = started.elapsed();
    debug!(
        overall = %overall,
        checks = results.len(),
        missing = missing.len(),
        duration_ms = duration.as_millis() as u64,
        "Health check cycle complete"
    );

    CycleReport {
        overall,
        results,
        missing,
        duration,
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HealthStatus;
    use async_trait::async_trait;

    struct Fixed {
        name: &'static str,
        status: HealthStatus,
        delay: Duration,
        timeout: Option<Duration>,
    }

    impl Fixed {
        fn new(name: &'static str, status: HealthStatus) -> Arc<dyn HealthCheck> {
            Arc::new(Self {
                name,
                status,
                delay: Duration::ZERO,
                timeout: None,
            })
        }
    }

    #[async_trait]
    impl HealthCheck for Fixed {
        async fn check(&self) -> HealthCheckResult {
            tokio::time::sleep(self.delay).await;
            match self.status {
                HealthStatus::Healthy => HealthCheckResult::healthy(self.name, self.delay, "ok"),
                HealthStatus::Degraded => {
                    HealthCheckResult::degraded(self.name, self.delay, "slow", None)
                }
                HealthStatus::Unhealthy | HealthStatus::Unknown => {
                    HealthCheckResult::unhealthy(self.name, self.delay, "down", None)
                }
            }
        }

        fn name(&self) -> &str {
            self.name
        }

        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }
    }

    #[tokio::test]
    async fn test_results_keep_configuration_order() {
        let checks = vec![
            Fixed::new("database", HealthStatus::Healthy),
            Fixed::new("redis", HealthStatus::Unhealthy),
            Fixed::new("grpc", HealthStatus::Healthy),
        ];

        let report = run_cycle(&checks, CycleTiming::default()).await;
        let names: Vec<_> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["database", "redis", "grpc"]);
        assert_eq!(report.overall, HealthStatus::Degraded);
        assert!(report.missing.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_check_times_out_as_unhealthy() {
        let checks: Vec<Arc<dyn HealthCheck>> = vec![
            Fixed::new("database", HealthStatus::Healthy),
            Arc::new(Fixed {
                name: "rpc",
                status: HealthStatus::Healthy,
                delay: Duration::from_secs(30),
                timeout: None,
            }),
        ];

        let timing = CycleTiming {
            check_timeout: Duration::from_secs(2),
            cycle_grace: Duration::from_secs(1),
        };
        let report = run_cycle(&checks, timing).await;

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[1].status, HealthStatus::Unhealthy);
        assert_eq!(report.overall, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_past_cycle_deadline_is_missing() {
        let checks: Vec<Arc<dyn HealthCheck>> = vec![
            Fixed::new("database", HealthStatus::Healthy),
            Arc::new(Fixed {
                name: "hung",
                status: HealthStatus::Healthy,
                delay: Duration::from_secs(30),
                timeout: Some(Duration::from_secs(60)),
            }),
        ];

        let timing = CycleTiming {
            check_timeout: Duration::from_secs(1),
            cycle_grace: Duration::from_secs(1),
        };
        let report = run_cycle(&checks, timing).await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.missing, vec!["hung".to_string()]);
        assert_eq!(report.overall, HealthStatus::Healthy);
        assert!(report.duration <= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_empty_cycle_is_healthy() {
        let report = run_cycle(&[], CycleTiming::default()).await;
        assert!(report.results.is_empty());
        assert_eq!(report.overall, HealthStatus::Healthy);
    }
}
