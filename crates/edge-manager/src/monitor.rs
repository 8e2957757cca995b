//! Periodic metrics collection.
//!
//! Every tick the [`Monitor`] assembles one [`SystemMetrics`] snapshot from
//! the resource sampler and the external services, appends it to the bounded
//! [`MetricsHistory`] and raises an alert for every breached threshold.

use crate::config::{MonitorSettings, MonitorThresholds, Threshold};
use crate::lifecycle::Lifecycle;
use crate::metrics::MetricsRegistry;
use crate::ports::{AlertSink, MetricsSource, Services};
use crate::types::{Alert, AlertLevel, SystemMetrics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Component, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use sysinfo::System;
use tokio::sync::RwLock;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source value for monitor alerts
pub const MONITOR_SOURCE: &str = "system_monitor";

/// Host resource usage in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
}

#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self) -> Result<ResourceSample>;
}

/// Samples CPU, memory and disk through `sysinfo`.
///
/// CPU usage is the delta between two refreshes, so the first sample after
/// construction reads low.
pub struct SysinfoSampler {
    system: Arc<Mutex<System>>,
    disk_path: PathBuf,
}

impl SysinfoSampler {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system: Arc::new(Mutex::new(system)),
            disk_path: disk_path.into(),
        }
    }
}

#[async_trait]
impl ResourceSampler for SysinfoSampler {
    async fn sample(&self) -> Result<ResourceSample> {
        let system = self.system.clone();
        let disk_path = self.disk_path.clone();

        tokio::task::spawn_blocking(move || {
            let (cpu_usage, memory_usage) = {
                let mut sys = system.lock().unwrap_or_else(PoisonError::into_inner);
                sys.refresh_cpu();
                sys.refresh_memory();
                let total = sys.total_memory();
                let memory = if total == 0 {
                    0.0
                } else {
                    sys.used_memory() as f64 / total as f64 * 100.0
                };
                (sys.global_cpu_info().cpu_usage() as f64, memory)
            };

            let disk_usage = match healthcheck::checkers::disk_usage_percent(&disk_path) {
                Ok(percent) => percent,
                Err(e) => {
                    warn!(path = %disk_path.display(), error = %e, "Disk usage unavailable");
                    0.0
                }
            };

            ResourceSample {
                cpu_usage,
                memory_usage,
                disk_usage,
            }
        })
        .await
        .map_err(|e| Error::internal(Component::Monitor, e))
    }
}

/// Bounded ring buffer of snapshots, oldest evicted first.
pub struct MetricsHistory {
    capacity: usize,
    snapshots: RwLock<VecDeque<SystemMetrics>>,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            snapshots: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub async fn push(&self, snapshot: SystemMetrics) {
        let mut snapshots = self.snapshots.write().await;
        while snapshots.len() >= self.capacity {
            snapshots.pop_front();
        }
        snapshots.push_back(snapshot);
    }

    /// Snapshots in collection order, most recent last
    pub async fn snapshots(&self) -> Vec<SystemMetrics> {
        self.snapshots.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl MetricsSource for MetricsHistory {
    async fn latest(&self) -> Option<SystemMetrics> {
        self.snapshots.read().await.back().cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub last_update: Option<DateTime<Utc>>,
    /// Snapshots currently held in history
    pub metrics_count: usize,
    pub collections: u64,
    pub alerts_raised: u64,
    pub current: Option<SystemMetrics>,
}

#[derive(Default)]
struct MonitorState {
    last_update: Option<DateTime<Utc>>,
    collections: u64,
    alerts_raised: u64,
}

pub struct Monitor {
    settings: MonitorSettings,
    services: Services,
    sampler: Arc<dyn ResourceSampler>,
    sink: Arc<dyn AlertSink>,
    history: Arc<MetricsHistory>,
    state: RwLock<MonitorState>,
    lifecycle: Lifecycle,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Monitor {
    pub fn new(
        settings: MonitorSettings,
        services: Services,
        sampler: Arc<dyn ResourceSampler>,
        sink: Arc<dyn AlertSink>,
        history: Arc<MetricsHistory>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            settings,
            services,
            sampler,
            sink,
            history,
            state: RwLock::new(MonitorState::default()),
            lifecycle: Lifecycle::new(Component::Monitor),
            metrics,
        }
    }

    /// Run the collection loop until the scope is cancelled or [`stop`] is
    /// called.
    ///
    /// [`stop`]: Monitor::stop
    pub async fn run(&self, scope: &CancellationToken) -> Result<()> {
        let running = self.lifecycle.begin(scope)?;
        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            retention = self.history.capacity(),
            "Monitor started"
        );

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = running.token.cancelled() => break,
                _ = ticker.tick() => {
                    self.collect_once().await;
                }
            }
        }

        info!("Monitor stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Collect, store and evaluate one snapshot.
    pub async fn collect_once(&self) -> SystemMetrics {
        let start = Instant::now();
        let snapshot = self.collect_snapshot().await;
        self.history.push(snapshot.clone()).await;

        let alerts = evaluate_thresholds(&snapshot, &self.settings.thresholds);
        let raised = alerts.len() as u64;
        for alert in alerts {
            debug!(alert_type = %alert.alert_type, level = %alert.level, "Threshold breached");
            self.sink.create_alert(alert).await;
        }

        {
            let mut state = self.state.write().await;
            state.last_update = Some(snapshot.timestamp);
            state.collections += 1;
            state.alerts_raised += raised;
        }

        if let Some(ref m) = self.metrics {
            m.record_snapshot(&snapshot);
            m.record_tick("monitor", start.elapsed());
        }
        snapshot
    }

    async fn collect_snapshot(&self) -> SystemMetrics {
        let mut snapshot = SystemMetrics::empty();

        match self.sampler.sample().await {
            Ok(sample) => {
                snapshot.resource.cpu_usage = sample.cpu_usage;
                snapshot.resource.memory_usage = sample.memory_usage;
                snapshot.resource.disk_usage = sample.disk_usage;
            }
            Err(e) => warn!(error = %e, "Resource sampling failed"),
        }
        snapshot.resource.task_count =
            tokio::runtime::Handle::current().metrics().num_alive_tasks() as u64;

        match self.services.tasks.stats().await {
            Ok(stats) => {
                let app = &mut snapshot.application;
                app.active_tasks = stats.active_tasks;
                app.completed_tasks = stats.completed_tasks;
                app.failed_tasks = stats.failed_tasks;
                app.queue_size = stats.queue_size;
                app.error_rate = stats.error_rate;
                app.response_time = stats.avg_response_time;
            }
            Err(e) => warn!(error = %e, "Task statistics unavailable"),
        }

        if let Some(ref data) = self.services.data {
            match data.pool_stats().await {
                Ok(pool) => {
                    snapshot.store.connections = pool.open_connections;
                    snapshot.store.in_use = pool.in_use;
                }
                Err(e) => warn!(error = %e, "Store pool statistics unavailable"),
            }
        }

        if let Some(ref cache) = self.services.cache {
            match cache.stats().await {
                Ok(stats) => {
                    snapshot.cache.ok = true;
                    snapshot.cache.key_count = stats.key_count;
                    snapshot.cache.hit_rate = stats.hit_rate;
                }
                Err(e) => warn!(error = %e, "Cache statistics unavailable"),
            }
        }

        match self.services.models.active_models().await {
            Ok(models) => snapshot.models.active_models = models.len() as u64,
            Err(e) => warn!(error = %e, "Active model count unavailable"),
        }

        snapshot
    }

    pub async fn current_snapshot(&self) -> Option<SystemMetrics> {
        self.history.latest().await
    }

    pub async fn history(&self) -> Vec<SystemMetrics> {
        self.history.snapshots().await
    }

    pub async fn status(&self) -> MonitorStatus {
        let (last_update, collections, alerts_raised) = {
            let state = self.state.read().await;
            (state.last_update, state.collections, state.alerts_raised)
        };
        MonitorStatus {
            running: self.is_running(),
            last_update,
            metrics_count: self.history.len().await,
            collections,
            alerts_raised,
            current: self.history.latest().await,
        }
    }
}

/// Which tier `value` breaches, and the limit it crossed.
fn breach(value: f64, threshold: &Threshold) -> Option<(AlertLevel, f64)> {
    match threshold.critical {
        Some(critical) if value > critical => Some((AlertLevel::Critical, critical)),
        _ if value > threshold.warning => Some((AlertLevel::Warning, threshold.warning)),
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum Unit {
    Percent,
    Millis,
    Count,
}

/// One alert per breached threshold.
pub fn evaluate_thresholds(
    snapshot: &SystemMetrics,
    thresholds: &MonitorThresholds,
) -> Vec<Alert> {
    let res = &snapshot.resource;
    let app = &snapshot.application;

    let watched = [
        ("high_cpu_usage", "CPU usage", Unit::Percent, res.cpu_usage, thresholds.cpu_usage),
        (
            "high_memory_usage",
            "Memory usage",
            Unit::Percent,
            res.memory_usage,
            thresholds.memory_usage,
        ),
        ("high_disk_usage", "Disk usage", Unit::Percent, res.disk_usage, thresholds.disk_usage),
        ("high_error_rate", "Error rate", Unit::Percent, app.error_rate, thresholds.error_rate),
        (
            "high_response_time",
            "Average response time",
            Unit::Millis,
            app.response_time,
            thresholds.response_time,
        ),
        (
            "too_many_active_tasks",
            "Active tasks count",
            Unit::Count,
            app.active_tasks as f64,
            thresholds.active_tasks,
        ),
        (
            "too_many_failed_tasks",
            "Failed tasks count",
            Unit::Count,
            app.failed_tasks as f64,
            thresholds.failed_tasks,
        ),
        (
            "large_queue_size",
            "Queue size",
            Unit::Count,
            app.queue_size as f64,
            thresholds.queue_size,
        ),
    ];

    watched
        .into_iter()
        .filter_map(|(alert_type, label, unit, value, threshold)| {
            let (level, limit) = breach(value, &threshold)?;
            let message = match unit {
                Unit::Percent => {
                    format!("{} is {:.2}%, exceeding threshold {:.2}%", label, value, limit)
                }
                Unit::Millis => {
                    format!("{} is {:.2}ms, exceeding threshold {:.2}ms", label, value, limit)
                }
                Unit::Count => {
                    format!("{} is {}, exceeding threshold {}", label, value as u64, limit)
                }
            };
            Some(Alert::new(alert_type, level, MONITOR_SOURCE, message))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_alerts_below_thresholds() {
        let snapshot = SystemMetrics::empty();
        assert!(evaluate_thresholds(&snapshot, &MonitorThresholds::default()).is_empty());
    }

    #[test]
    fn test_warning_and_critical_tiers() {
        let thresholds = MonitorThresholds::default();
        let mut snapshot = SystemMetrics::empty();
        snapshot.resource.cpu_usage = 85.0;
        snapshot.resource.memory_usage = 97.0;

        let alerts = evaluate_thresholds(&snapshot, &thresholds);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert_type, "high_cpu_usage");
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert_eq!(alerts[0].message, "CPU usage is 85.00%, exceeding threshold 80.00%");
        assert_eq!(alerts[1].alert_type, "high_memory_usage");
        assert_eq!(alerts[1].level, AlertLevel::Critical);
        assert_eq!(alerts[1].source, MONITOR_SOURCE);
    }

    #[test]
    fn test_threshold_is_strictly_greater() {
        let mut snapshot = SystemMetrics::empty();
        snapshot.resource.cpu_usage = 80.0;
        assert!(evaluate_thresholds(&snapshot, &MonitorThresholds::default()).is_empty());
    }

    #[test]
    fn test_warning_only_threshold() {
        let mut snapshot = SystemMetrics::empty();
        snapshot.application.active_tasks = 10_000;
        let alerts = evaluate_thresholds(&snapshot, &MonitorThresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "too_many_active_tasks");
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert_eq!(alerts[0].message, "Active tasks count is 10000, exceeding threshold 100");
    }

    #[test]
    fn test_application_alert_types() {
        let mut snapshot = SystemMetrics::empty();
        snapshot.application.error_rate = 6.0;
        snapshot.application.response_time = 1500.0;
        snapshot.application.failed_tasks = 11;
        snapshot.application.queue_size = 600;

        let alerts = evaluate_thresholds(&snapshot, &MonitorThresholds::default());
        let kinds: Vec<_> = alerts
            .iter()
            .map(|a| (a.alert_type.as_str(), a.level))
            .collect();
        assert_eq!(
            kinds,
            [
                ("high_error_rate", AlertLevel::Critical),
                ("high_response_time", AlertLevel::Warning),
                ("too_many_failed_tasks", AlertLevel::Critical),
                ("large_queue_size", AlertLevel::Warning),
            ]
        );
    }

    #[tokio::test]
    async fn test_history_evicts_oldest() {
        let history = MetricsHistory::new(2);
        for cpu in [1.0, 2.0, 3.0] {
            let mut s = SystemMetrics::empty();
            s.resource.cpu_usage = cpu;
            history.push(s).await;
        }
        let cpus: Vec<_> = history
            .snapshots()
            .await
            .iter()
            .map(|s| s.resource.cpu_usage)
            .collect();
        assert_eq!(cpus, [2.0, 3.0]);
        assert_eq!(history.latest().await.unwrap().resource.cpu_usage, 3.0);
    }

    #[tokio::test]
    async fn test_empty_history_has_no_latest() {
        let history = MetricsHistory::new(0);
        assert_eq!(history.capacity(), 1);
        assert!(history.latest().await.is_none());
        assert!(history.is_empty().await);
    }
}
