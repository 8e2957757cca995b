//! Prometheus metrics for the edge manager.

use crate::types::SystemMetrics;
use healthcheck::HealthStatus;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

/// Labels for per-loop metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LoopLabels {
    /// Loop name (scheduler, monitor, alert_rules, alert_sweep, health)
    pub component: String,
}

/// Labels for task execution metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskLabels {
    /// Task action (inference, model_update, data_cleanup, health_check)
    pub action: String,
    /// Outcome (completed, failed)
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ActionLabels {
    pub action: String,
}

/// Labels for alert processing metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AlertLabels {
    /// Alert source (system_monitor, alert_manager, health_checker)
    pub source: String,
    /// Outcome (dispatched, suppressed)
    pub outcome: String,
}

/// Labels for channel delivery metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeliveryLabels {
    /// Channel name (console, email, webhook, slack, dingtalk)
    pub channel: String,
    /// Result (success, failure)
    pub result: String,
}

/// Labels for health check result metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CheckLabels {
    pub check: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceLabels {
    /// Resource (cpu, memory, disk)
    pub resource: String,
}

/// Metrics registry with all edge manager metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    /// Loop iterations
    loop_ticks_total: Family<LoopLabels, Counter>,
    /// Loop iteration duration
    loop_duration_seconds: Family<LoopLabels, Histogram>,
    /// Supervised loops that ended with an error or panic
    loop_failures_total: Family<LoopLabels, Counter>,

    /// Executed tasks by outcome
    tasks_total: Family<TaskLabels, Counter>,
    /// Task execution time
    task_duration_seconds: Family<ActionLabels, Histogram>,
    /// Queued tasks
    queue_depth: Gauge,
    /// Eligible tasks dropped because the queue was full
    tasks_skipped_total: Counter,

    /// Alerts processed by outcome
    alerts_total: Family<AlertLabels, Counter>,
    /// Per-channel deliveries by result
    notifications_total: Family<DeliveryLabels, Counter>,

    /// Health check results by status
    health_checks_total: Family<CheckLabels, Counter>,
    /// Overall health (0=healthy, 1=degraded, 2=unhealthy, -1=unknown)
    health_overall: Gauge,

    /// Latest sampled resource usage in percent
    resource_usage_percent: Family<ResourceLabels, Gauge<f64, AtomicU64>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("edge_manager");

        let loop_ticks_total = Family::<LoopLabels, Counter>::default();
        registry.register(
            "loop_ticks",
            "Control loop iterations",
            loop_ticks_total.clone(),
        );

        // Exponential buckets from 1ms to ~16s
        let loop_duration_seconds = Family::<LoopLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 15))
        });
        registry.register(
            "loop_duration_seconds",
            "Control loop iteration duration in seconds",
            loop_duration_seconds.clone(),
        );

        let loop_failures_total = Family::<LoopLabels, Counter>::default();
        registry.register(
            "loop_failures",
            "Supervised loops that ended with an error or panic",
            loop_failures_total.clone(),
        );

        let tasks_total = Family::<TaskLabels, Counter>::default();
        registry.register("tasks", "Executed tasks by outcome", tasks_total.clone());

        let task_duration_seconds = Family::<ActionLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 18))
        });
        registry.register(
            "task_duration_seconds",
            "Task execution time in seconds",
            task_duration_seconds.clone(),
        );

        let queue_depth = Gauge::default();
        registry.register("queue_depth", "Tasks waiting in the queue", queue_depth.clone());

        let tasks_skipped_total = Counter::default();
        registry.register(
            "tasks_skipped",
            "Eligible tasks skipped because the queue was full",
            tasks_skipped_total.clone(),
        );

        let alerts_total = Family::<AlertLabels, Counter>::default();
        registry.register(
            "alerts",
            "Alerts processed by source and outcome",
            alerts_total.clone(),
        );

        let notifications_total = Family::<DeliveryLabels, Counter>::default();
        registry.register(
            "notifications",
            "Notification deliveries by channel and result",
            notifications_total.clone(),
        );

        let health_checks_total = Family::<CheckLabels, Counter>::default();
        registry.register(
            "health_checks",
            "Health check results by check and status",
            health_checks_total.clone(),
        );

        let health_overall = Gauge::default();
        registry.register(
            "health_overall",
            "Overall health (0=healthy, 1=degraded, 2=unhealthy, -1=unknown)",
            health_overall.clone(),
        );

        let resource_usage_percent = Family::<ResourceLabels, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "resource_usage_percent",
            "Latest sampled host resource usage",
            resource_usage_percent.clone(),
        );

        Self {
            registry,
            loop_ticks_total,
            loop_duration_seconds,
            loop_failures_total,
            tasks_total,
            task_duration_seconds,
            queue_depth,
            tasks_skipped_total,
            alerts_total,
            notifications_total,
            health_checks_total,
            health_overall,
            resource_usage_percent,
        }
    }

    /// Record one loop iteration
    pub fn record_tick(&self, component: &str, duration: Duration) {
        let labels = LoopLabels {
            component: component.to_string(),
        };
        self.loop_ticks_total.get_or_create(&labels).inc();
        self.loop_duration_seconds
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());
    }

    pub fn record_loop_failure(&self, component: &str) {
        self.loop_failures_total
            .get_or_create(&LoopLabels {
                component: component.to_string(),
            })
            .inc();
    }

    /// Record a finished task
    pub fn record_task(&self, action: &str, succeeded: bool, duration: Duration) {
        self.tasks_total
            .get_or_create(&TaskLabels {
                action: action.to_string(),
                outcome: if succeeded { "completed" } else { "failed" }.to_string(),
            })
            .inc();
        self.task_duration_seconds
            .get_or_create(&ActionLabels {
                action: action.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn record_task_skipped(&self) {
        self.tasks_skipped_total.inc();
    }

    /// Record an alert passing through the alert manager
    pub fn record_alert(&self, source: &str, suppressed: bool) {
        self.alerts_total
            .get_or_create(&AlertLabels {
                source: source.to_string(),
                outcome: if suppressed { "suppressed" } else { "dispatched" }.to_string(),
            })
            .inc();
    }

    pub fn record_delivery(&self, channel: &str, delivered: bool) {
        self.notifications_total
            .get_or_create(&DeliveryLabels {
                channel: channel.to_string(),
                result: if delivered { "success" } else { "failure" }.to_string(),
            })
            .inc();
    }

    pub fn record_health_check(&self, check: &str, status: HealthStatus) {
        self.health_checks_total
            .get_or_create(&CheckLabels {
                check: check.to_string(),
                status: status.as_str().to_string(),
            })
            .inc();
    }

    pub fn set_health_overall(&self, status: HealthStatus) {
        let value = match status {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
            HealthStatus::Unknown => -1,
        };
        self.health_overall.set(value);
    }

    /// Publish the resource part of a snapshot
    pub fn record_snapshot(&self, snapshot: &SystemMetrics) {
        for (resource, value) in [
            ("cpu", snapshot.resource.cpu_usage),
            ("memory", snapshot.resource.memory_usage),
            ("disk", snapshot.resource.disk_usage),
        ] {
            self.resource_usage_percent
                .get_or_create(&ResourceLabels {
                    resource: resource.to_string(),
                })
                .set(value);
        }
    }

    /// Encode the registry in the Prometheus text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_loop_metrics() {
        let registry = MetricsRegistry::new();
        registry.record_tick("scheduler", Duration::from_millis(3));
        registry.record_tick("scheduler", Duration::from_millis(5));
        registry.record_loop_failure("monitor");

        let text = registry.encode().unwrap();
        assert!(text.contains("edge_manager_loop_ticks_total{component=\"scheduler\"} 2"));
        assert!(text.contains("edge_manager_loop_failures_total{component=\"monitor\"} 1"));
    }

    #[test]
    fn test_task_metrics() {
        let registry = MetricsRegistry::new();
        registry.record_task("inference", true, Duration::from_millis(40));
        registry.record_task("inference", false, Duration::from_millis(10));
        registry.set_queue_depth(4);
        registry.record_task_skipped();

        let text = registry.encode().unwrap();
        assert!(text.contains("outcome=\"failed\""));
        assert!(text.contains("edge_manager_queue_depth 4"));
        assert!(text.contains("edge_manager_tasks_skipped_total 1"));
    }

    #[test]
    fn test_alert_and_delivery_metrics() {
        let registry = MetricsRegistry::new();
        registry.record_alert("system_monitor", false);
        registry.record_alert("system_monitor", true);
        registry.record_delivery("webhook", false);

        let text = registry.encode().unwrap();
        assert!(text.contains("outcome=\"suppressed\""));
        assert!(text.contains("result=\"failure\""));
    }

    #[test]
    fn test_health_metrics() {
        let registry = MetricsRegistry::new();
        registry.record_health_check("database", HealthStatus::Degraded);
        registry.set_health_overall(HealthStatus::Unhealthy);
        assert!(registry.encode().unwrap().contains("edge_manager_health_overall 2"));
    }

    #[test]
    fn test_snapshot_gauges() {
        let registry = MetricsRegistry::new();
        let mut snapshot = SystemMetrics::empty();
        snapshot.resource.cpu_usage = 42.5;
        registry.record_snapshot(&snapshot);
        assert!(registry.encode().unwrap().contains("resource=\"cpu\"} 42.5"));
    }
}
