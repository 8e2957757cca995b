//! Periodic dependency health checking.

use crate::config::HealthSettings;
use crate::lifecycle::Lifecycle;
use crate::metrics::MetricsRegistry;
use crate::ports::{AlertSink, HealthCycle, Services};
use crate::types::{Alert, AlertLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Component, Result};
use healthcheck::{
    CycleReport, CycleTiming, DependencyCheck, DependencyProbe, EndpointCheck, HealthCheck,
    HealthCheckResult, HealthStatus, UsageCheck, UsageThresholds, run_cycle,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source value for health checker alerts
pub const HEALTH_SOURCE: &str = "health_checker";

/// One configured health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckSpec {
    /// Relational store: connect, then run a trivial query
    Store { name: String },
    /// Key-value cache: connect, then round-trip a key
    Cache { name: String },
    /// RPC pool: connect, then issue a no-op call
    Rpc { name: String },
    Disk {
        name: String,
        path: PathBuf,
        #[serde(default)]
        thresholds: UsageThresholds,
    },
    Memory {
        name: String,
        #[serde(default)]
        thresholds: UsageThresholds,
    },
    Endpoint {
        name: String,
        url: String,
        /// Accepted status codes; empty means 200 only
        #[serde(default)]
        expected_codes: Vec<u16>,
        /// Overrides the cycle's per-check timeout
        #[serde(default, with = "humantime_serde")]
        timeout: Option<Duration>,
    },
}

impl CheckSpec {
    /// Store, cache, RPC pool, root filesystem and memory.
    pub fn defaults() -> Vec<CheckSpec> {
        vec![
            CheckSpec::Store {
                name: "database".to_string(),
            },
            CheckSpec::Cache {
                name: "redis".to_string(),
            },
            CheckSpec::Rpc {
                name: "grpc".to_string(),
            },
            CheckSpec::Disk {
                name: "disk".to_string(),
                path: PathBuf::from("/"),
                thresholds: UsageThresholds::default(),
            },
            CheckSpec::Memory {
                name: "memory".to_string(),
                thresholds: UsageThresholds::default(),
            },
        ]
    }

    pub fn name(&self) -> &str {
        match self {
            CheckSpec::Store { name }
            | CheckSpec::Cache { name }
            | CheckSpec::Rpc { name }
            | CheckSpec::Disk { name, .. }
            | CheckSpec::Memory { name, .. }
            | CheckSpec::Endpoint { name, .. } => name,
        }
    }
}

/// Build the check registry once from configuration.
///
/// Dependency checks whose service is not wired are left out with a warning.
pub fn build_checks(
    specs: &[CheckSpec],
    services: &Services,
    default_timeout: Duration,
) -> Result<Vec<Arc<dyn HealthCheck>>> {
    let mut checks: Vec<Arc<dyn HealthCheck>> = Vec::with_capacity(specs.len());

    for spec in specs {
        let probe: Option<Arc<dyn DependencyProbe>> = match spec {
            CheckSpec::Store { .. } => {
                services.data.clone().map(|d| d as Arc<dyn DependencyProbe>)
            }
            CheckSpec::Cache { .. } => {
                services.cache.clone().map(|c| c as Arc<dyn DependencyProbe>)
            }
            CheckSpec::Rpc { .. } => services.rpc.clone().map(|r| r as Arc<dyn DependencyProbe>),
            CheckSpec::Disk {
                name,
                path,
                thresholds,
            } => {
                checks.push(Arc::new(UsageCheck::disk(name, path, *thresholds)));
                continue;
            }
            CheckSpec::Memory { name, thresholds } => {
                checks.push(Arc::new(UsageCheck::memory(name, *thresholds)));
                continue;
            }
            CheckSpec::Endpoint {
                name,
                url,
                expected_codes,
                timeout,
            } => {
                let check = EndpointCheck::new(
                    name,
                    url,
                    expected_codes.clone(),
                    timeout.unwrap_or(default_timeout),
                )?;
                checks.push(Arc::new(check));
                continue;
            }
        };

        match probe {
            Some(probe) => checks.push(Arc::new(DependencyCheck::new(spec.name(), probe))),
            None => warn!(check = spec.name(), "No service wired for dependency check, skipping"),
        }
    }

    Ok(checks)
}

/// Latest health picture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    /// Latest result per check
    pub components: BTreeMap<String, HealthCheckResult>,
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
    /// Checks that missed the last cycle's deadline
    pub missing: Vec<String>,
}

struct LatestHealth {
    overall: HealthStatus,
    components: BTreeMap<String, HealthCheckResult>,
    last_check_at: Option<DateTime<Utc>>,
    missing: Vec<String>,
}

pub struct HealthChecker {
    settings: HealthSettings,
    checks: Vec<Arc<dyn HealthCheck>>,
    sink: Option<Arc<dyn AlertSink>>,
    latest: RwLock<LatestHealth>,
    started_at: Instant,
    lifecycle: Lifecycle,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl HealthChecker {
    pub fn new(
        settings: HealthSettings,
        checks: Vec<Arc<dyn HealthCheck>>,
        sink: Option<Arc<dyn AlertSink>>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            settings,
            checks,
            sink,
            latest: RwLock::new(LatestHealth {
                overall: HealthStatus::Unknown,
                components: BTreeMap::new(),
                last_check_at: None,
                missing: Vec::new(),
            }),
            started_at: Instant::now(),
            lifecycle: Lifecycle::new(Component::HealthChecker),
            metrics,
        }
    }

    fn timing(&self) -> CycleTiming {
        CycleTiming {
            check_timeout: self.settings.check_timeout,
            cycle_grace: self.settings.cycle_grace,
        }
    }

    /// Check immediately, then on every interval, until cancelled.
    pub async fn run(&self, scope: &CancellationToken) -> Result<()> {
        let running = self.lifecycle.begin(scope)?;
        info!(
            checks = self.checks.len(),
            interval_ms = self.settings.interval.as_millis() as u64,
            "Health checker started"
        );

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = running.token.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = running.token.cancelled() => break,
                        _ = self.check_now() => {}
                    }
                }
            }
        }

        info!("Health checker stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Run one cycle and replace the previous results.
    pub async fn check_now(&self) -> CycleReport {
        let start = Instant::now();
        let report = run_cycle(&self.checks, self.timing()).await;

        for name in &report.missing {
            warn!(check = %name, "Health check missed the cycle deadline");
        }

        {
            let mut latest = self.latest.write().await;
            latest.overall = report.overall;
            latest.components = report
                .results
                .iter()
                .map(|r| (r.name.clone(), r.clone()))
                .collect();
            latest.last_check_at = Some(report.completed_at);
            latest.missing = report.missing.clone();
        }

        if let Some(ref m) = self.metrics {
            for result in &report.results {
                m.record_health_check(&result.name, result.status);
            }
            m.set_health_overall(report.overall);
            m.record_tick("health", start.elapsed());
        }

        if let Some(ref sink) = self.sink {
            if self.settings.alert_on_failure {
                for result in report.results.iter().filter(|r| !r.is_healthy()) {
                    sink.create_alert(failure_alert(result)).await;
                }
            }
        }

        debug!(
            overall = %report.overall,
            results = report.results.len(),
            missing = report.missing.len(),
            "Health check cycle complete"
        );
        report
    }

    pub async fn health_status(&self) -> HealthReport {
        let latest = self.latest.read().await;
        HealthReport {
            overall: latest.overall,
            components: latest.components.clone(),
            last_check_at: latest.last_check_at,
            uptime: self.started_at.elapsed(),
            missing: latest.missing.clone(),
        }
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks.iter().map(|c| c.name().to_string()).collect()
    }
}

#[async_trait]
impl HealthCycle for HealthChecker {
    async fn check_now(&self) -> CycleReport {
        HealthChecker::check_now(self).await
    }
}

fn failure_alert(result: &HealthCheckResult) -> Alert {
    let level = match result.status {
        HealthStatus::Unhealthy => AlertLevel::Critical,
        _ => AlertLevel::Warning,
    };
    Alert::new(
        format!("health_check_{}", result.name),
        level,
        HEALTH_SOURCE,
        format!("Health check failed for {}: {}", result.name, result.message),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackends;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collector(Mutex<Vec<Alert>>);

    #[async_trait]
    impl AlertSink for Collector {
        async fn create_alert(&self, alert: Alert) {
            self.0.lock().unwrap().push(alert);
        }
    }

    fn usage(name: &str, percent: f64) -> Arc<dyn HealthCheck> {
        Arc::new(UsageCheck::with_sampler(
            name,
            UsageThresholds::default(),
            move || Ok(percent),
        ))
    }

    #[test]
    fn test_default_specs() {
        let names: Vec<_> = CheckSpec::defaults()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, ["database", "redis", "grpc", "disk", "memory"]);
    }

    #[test]
    fn test_spec_from_yaml() {
        let yaml = r#"
- type: endpoint
  name: gateway
  url: http://127.0.0.1:8080/health
  expected_codes: [200, 204]
  timeout: 2s
- type: disk
  name: data
  path: /var/lib/edge
"#;
        let specs: Vec<CheckSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            specs[0],
            CheckSpec::Endpoint {
                name: "gateway".to_string(),
                url: "http://127.0.0.1:8080/health".to_string(),
                expected_codes: vec![200, 204],
                timeout: Some(Duration::from_secs(2)),
            }
        );
        assert_eq!(specs[1].name(), "data");
    }

    #[test]
    fn test_build_checks_skips_unwired_dependencies() {
        let mut services = MemoryBackends::new().services();
        services.cache = None;

        let checks =
            build_checks(&CheckSpec::defaults(), &services, Duration::from_secs(5)).unwrap();
        let names: Vec<_> = checks.iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, ["database", "grpc", "disk", "memory"]);
    }

    #[tokio::test]
    async fn test_check_now_replaces_results_and_alerts() {
        let sink = Arc::new(Collector::default());
        let checker = HealthChecker::new(
            HealthSettings::default(),
            vec![usage("disk", 10.0), usage("memory", 85.0), usage("scratch", 95.0)],
            Some(sink.clone() as Arc<dyn AlertSink>),
            None,
        );

        let report = checker.check_now().await;
        assert_eq!(report.overall, HealthStatus::Degraded);

        let status = checker.health_status().await;
        assert_eq!(status.components.len(), 3);
        assert!(status.last_check_at.is_some());

        let alerts = sink.0.lock().unwrap().clone();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert_type, "health_check_memory");
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert_eq!(alerts[1].alert_type, "health_check_scratch");
        assert_eq!(alerts[1].level, AlertLevel::Critical);
        assert_eq!(alerts[1].source, HEALTH_SOURCE);
    }

    #[tokio::test]
    async fn test_alerting_can_be_disabled() {
        let sink = Arc::new(Collector::default());
        let settings = HealthSettings {
            alert_on_failure: false,
            ..HealthSettings::default()
        };
        let checker = HealthChecker::new(
            settings,
            vec![usage("disk", 99.0)],
            Some(sink.clone() as Arc<dyn AlertSink>),
            None,
        );

        assert_eq!(checker.check_now().await.overall, HealthStatus::Unhealthy);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_until_first_cycle() {
        let checker = HealthChecker::new(HealthSettings::default(), Vec::new(), None, None);
        let before = checker.health_status().await;
        assert_eq!(before.overall, HealthStatus::Unknown);
        assert!(before.last_check_at.is_none());

        // Nothing configured means nothing failing
        assert_eq!(checker.check_now().await.overall, HealthStatus::Healthy);
        assert_eq!(checker.health_status().await.overall, HealthStatus::Healthy);
    }
}
