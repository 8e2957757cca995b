//! Health check implementations.

use crate::types::{HealthCheckResult, UsageThresholds};
use async_trait::async_trait;
use common::{Component, Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use tracing::{debug, warn};

/// One probe the health checker runs every cycle.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform the check. Failures are reported in the result, never panicked.
    async fn check(&self) -> HealthCheckResult;

    /// Unique name of this check, used as the component key.
    fn name(&self) -> &str;

    /// Per-check timeout overriding the cycle default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// A remote dependency that can be reached and then exercised.
///
/// `connect` answers "is it there at all", `exercise` answers "does it do
/// real work" (a query, a write, a health RPC).
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn exercise(&self) -> Result<()>;
}

/// Health check over a [`DependencyProbe`].
///
/// A failed connect is unhealthy, a failed exercise is degraded.
pub struct DependencyCheck {
    name: String,
    probe: Arc<dyn DependencyProbe>,
}

impl DependencyCheck {
    pub fn new(name: impl Into<String>, probe: Arc<dyn DependencyProbe>) -> Self {
        Self {
            name: name.into(),
            probe,
        }
    }
}

#[async_trait]
impl HealthCheck for DependencyCheck {
    async fn check(&self) -> HealthCheckResult {
        let start = Instant::now();

        if let Err(e) = self.probe.connect().await {
            warn!(check = %self.name, error = %e, "Dependency unreachable");
            return HealthCheckResult::unhealthy(
                &self.name,
                start.elapsed(),
                format!("{} connection failed", self.name),
                Some(e.to_string()),
            );
        }

        match self.probe.exercise().await {
            Ok(()) => {
                let latency = start.elapsed();
                debug!(
                    check = %self.name,
                    latency_ms = latency.as_millis() as u64,
                    "Dependency check passed"
                );
                HealthCheckResult::healthy(&self.name, latency, format!("{} is healthy", self.name))
            }
            Err(e) => {
                warn!(check = %self.name, error = %e, "Dependency reachable but impaired");
                HealthCheckResult::degraded(
                    &self.name,
                    start.elapsed(),
                    format!("{} operation failed", self.name),
                    Some(e.to_string()),
                )
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

type UsageSampler = Arc<dyn Fn() -> Result<f64> + Send + Sync>;

/// Usage percentage compared against degraded/unhealthy thresholds.
///
/// Backs the `disk` and `memory` checks; the sampler runs on the blocking pool.
pub struct UsageCheck {
    name: String,
    thresholds: UsageThresholds,
    sampler: UsageSampler,
}

impl UsageCheck {
    /// Build a usage check around an arbitrary sampler.
    pub fn with_sampler<F>(name: impl Into<String>, thresholds: UsageThresholds, sampler: F) -> Self
    where
        F: Fn() -> Result<f64> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            thresholds,
            sampler: Arc::new(sampler),
        }
    }

    /// Usage of the filesystem holding `path`.
    pub fn disk(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        thresholds: UsageThresholds,
    ) -> Self {
        let path = path.into();
        Self::with_sampler(name, thresholds, move || disk_usage_percent(&path))
    }

    /// Host memory usage.
    pub fn memory(name: impl Into<String>, thresholds: UsageThresholds) -> Self {
        Self::with_sampler(name, thresholds, memory_usage_percent)
    }
}

#[async_trait]
impl HealthCheck for UsageCheck {
    async fn check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let sampler = self.sampler.clone();

        let sampled = match tokio::task::spawn_blocking(move || (*sampler)()).await {
            Ok(sampled) => sampled,
            Err(e) => Err(Error::internal(Component::HealthChecker, e)),
        };

        let latency = start.elapsed();
        match sampled {
            Ok(percent) => {
                let status = self.thresholds.classify(percent);
                let message = format!("{} usage at {:.1}%", self.name, percent);
                HealthCheckResult::with_status(&self.name, status, latency, message, None)
            }
            Err(e) => {
                warn!(check = %self.name, error = %e, "Usage sampling failed");
                HealthCheckResult::unhealthy(
                    &self.name,
                    latency,
                    format!("{} usage unavailable", self.name),
                    Some(e.to_string()),
                )
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Percentage of used space on the disk whose mount point best matches `path`.
pub fn disk_usage_percent(path: &Path) -> Result<f64> {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .ok_or_else(|| {
            Error::not_found(
                Component::HealthChecker,
                "disk_usage",
                format!("mount point for {}", path.display()),
            )
        })?;

    let total = disk.total_space();
    if total == 0 {
        return Ok(0.0);
    }
    let used = total.saturating_sub(disk.available_space());
    Ok(used as f64 / total as f64 * 100.0)
}

/// Percentage of host memory in use.
pub fn memory_usage_percent() -> Result<f64> {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return Err(Error::dependency(
            Component::HealthChecker,
            "memory_usage",
            "total memory reported as zero",
        ));
    }
    Ok(sys.used_memory() as f64 / total as f64 * 100.0)
}

/// HTTP GET endpoint check.
///
/// A transport failure is unhealthy, an unexpected status code is degraded.
pub struct EndpointCheck {
    name: String,
    url: String,
    expected_codes: Vec<u16>,
    timeout_duration: Duration,
    client: reqwest::Client,
}

impl EndpointCheck {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        expected_codes: Vec<u16>,
        timeout_duration: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout_duration)
            .build()
            .map_err(|e| {
                Error::new(
                    common::ErrorKind::Config,
                    Component::HealthChecker,
                    "build_http_client",
                    e.to_string(),
                )
                .with_source(e)
            })?;

        Ok(Self {
            name: name.into(),
            url: url.into(),
            expected_codes,
            timeout_duration,
            client,
        })
    }

    fn accepts(&self, code: u16) -> bool {
        if self.expected_codes.is_empty() {
            code == 200
        } else {
            self.expected_codes.contains(&code)
        }
    }
}

#[async_trait]
impl HealthCheck for EndpointCheck {
    async fn check(&self) -> HealthCheckResult {
        let start = Instant::now();

        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let latency = start.elapsed();
                let code = response.status().as_u16();
                if self.accepts(code) {
                    debug!(
                        url = %self.url,
                        status = code,
                        latency_ms = latency.as_millis() as u64,
                        "Endpoint check passed"
                    );
                    let message = format!("{} returned {}", self.url, code);
                    HealthCheckResult::healthy(&self.name, latency, message)
                } else {
                    warn!(url = %self.url, status = code, "Endpoint returned unexpected status");
                    HealthCheckResult::degraded(
                        &self.name,
                        latency,
                        format!("{} returned {}", self.url, code),
                        Some(format!("unexpected status code: {}", code)),
                    )
                }
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Endpoint request failed");
                HealthCheckResult::unhealthy(
                    &self.name,
                    start.elapsed(),
                    format!("{} unreachable", self.url),
                    Some(e.to_string()),
                )
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout_duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HealthStatus;

    struct ScriptedProbe {
        connect_ok: bool,
        exercise_ok: bool,
    }

    #[async_trait]
    impl DependencyProbe for ScriptedProbe {
        async fn connect(&self) -> Result<()> {
            if self.connect_ok {
                Ok(())
            } else {
                Err(Error::dependency(Component::Store, "ping", "connection refused"))
            }
        }

        async fn exercise(&self) -> Result<()> {
            if self.exercise_ok {
                Ok(())
            } else {
                Err(Error::dependency(Component::Store, "query", "permission denied"))
            }
        }
    }

    fn dependency(connect_ok: bool, exercise_ok: bool) -> DependencyCheck {
        DependencyCheck::new(
            "database",
            Arc::new(ScriptedProbe {
                connect_ok,
                exercise_ok,
            }),
        )
    }

    #[tokio::test]
    async fn test_dependency_check_states() {
        assert_eq!(dependency(true, true).check().await.status, HealthStatus::Healthy);

        let degraded = dependency(true, false).check().await;
        assert_eq!(degraded.status, HealthStatus::Degraded);
        assert!(degraded.error.unwrap().contains("permission denied"));

        let unhealthy = dependency(false, true).check().await;
        assert_eq!(unhealthy.status, HealthStatus::Unhealthy);
        assert_eq!(unhealthy.name, "database");
    }

    #[tokio::test]
    async fn test_usage_check_thresholds() {
        let thresholds = UsageThresholds::default();
        for (percent, expected) in [
            (42.0, HealthStatus::Healthy),
            (85.0, HealthStatus::Degraded),
            (95.0, HealthStatus::Unhealthy),
        ] {
            let check = UsageCheck::with_sampler("disk", thresholds, move || Ok(percent));
            assert_eq!(check.check().await.status, expected, "at {}%", percent);
        }
    }

    #[tokio::test]
    async fn test_usage_check_sampler_error_is_unhealthy() {
        let check = UsageCheck::with_sampler("memory", UsageThresholds::default(), || {
            Err(Error::dependency(Component::HealthChecker, "memory_usage", "no /proc"))
        });
        let result = check.check().await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_endpoint_check_unreachable() {
        // Nothing listens on port 1
        let checker = EndpointCheck::new(
            "api",
            "http://127.0.0.1:1/health",
            vec![],
            Duration::from_millis(200),
        )
        .unwrap();

        let result = checker.check().await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(checker.timeout(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_memory_usage_is_a_percentage() {
        let percent = memory_usage_percent().unwrap();
        assert!((0.0..=100.0).contains(&percent));
    }
}
