//! Alert rules, suppression and notification fan-out.
//!
//! Every alert enters through [`AlertManager::raise`] (persist, then
//! process) or [`AlertManager::process_alert`]. An alert whose
//! `(type, source)` key is still inside its cooldown window is dropped;
//! otherwise it goes to every channel concurrently and the key is suppressed
//! for the cooldown, whether or not the channels succeeded.

use crate::config::AlertingSettings;
use crate::lifecycle::Lifecycle;
use crate::metrics::MetricsRegistry;
use crate::notifier::{Notifier, build_notifiers};
use crate::ports::{AlertSink, AlertStore, MetricsSource};
use crate::rules::Condition;
use crate::types::{Alert, AlertLevel, AlertRule};
use async_trait::async_trait;
use chrono::Utc;
use common::{Component, Error, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source value for rule alerts
pub const RULE_SOURCE: &str = "alert_manager";

/// What happened to a processed alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Inside the cooldown window of an earlier alert with the same key
    Suppressed,
    /// Sent to every channel; `failed` channels gave up after retries
    Dispatched { delivered: usize, failed: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertManagerStatus {
    pub running: bool,
    pub rules_count: usize,
    pub enabled_rules: usize,
    pub notifiers_count: usize,
    pub suppression_count: usize,
    pub processed: u64,
    pub dispatched: u64,
    pub suppressed: u64,
    pub delivery_failures: u64,
}

struct RuleEntry {
    rule: AlertRule,
    condition: Condition,
    last_evaluated: Option<Instant>,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    dispatched: AtomicU64,
    suppressed: AtomicU64,
    delivery_failures: AtomicU64,
}

pub struct AlertManager {
    settings: AlertingSettings,
    store: Arc<dyn AlertStore>,
    notifiers: Vec<Arc<dyn Notifier>>,
    source: Arc<dyn MetricsSource>,
    rules: RwLock<HashMap<String, RuleEntry>>,
    /// Suppression key to expiry
    suppression: RwLock<HashMap<String, Instant>>,
    counters: Counters,
    lifecycle: Lifecycle,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl AlertManager {
    pub fn new(
        settings: AlertingSettings,
        store: Arc<dyn AlertStore>,
        notifiers: Vec<Arc<dyn Notifier>>,
        source: Arc<dyn MetricsSource>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            settings,
            store,
            notifiers,
            source,
            rules: RwLock::new(HashMap::new()),
            suppression: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            lifecycle: Lifecycle::new(Component::AlertManager),
            metrics,
        }
    }

    /// Build channels from configuration and register the configured rules.
    pub fn from_settings(
        settings: AlertingSettings,
        store: Arc<dyn AlertStore>,
        source: Arc<dyn MetricsSource>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Result<Self> {
        let notifiers = build_notifiers(&settings.channels)?;
        let rules = settings.rules.clone();
        let load_defaults = settings.default_rules;

        let manager = Self::new(settings, store, notifiers, source, metrics);
        if load_defaults {
            manager.load_default_rules();
        }
        for rule in rules {
            manager.add_rule(rule)?;
        }
        Ok(manager)
    }

    /// Run the rule loop and the sweep loop until cancelled.
    pub async fn run(&self, scope: &CancellationToken) -> Result<()> {
        let running = self.lifecycle.begin(scope)?;
        let token = &running.token;
        info!(
            rules = self.rule_count(),
            channels = self.notifiers.len(),
            cooldown_ms = self.settings.cooldown.as_millis() as u64,
            "Alert manager started"
        );

        let rule_loop = async {
            let mut ticker = interval(self.settings.rule_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let start = std::time::Instant::now();
                        tokio::select! {
                            _ = token.cancelled() => break,
                            fired = self.evaluate_rules() => {
                                if fired > 0 {
                                    debug!(fired, "Alert rules fired");
                                }
                            }
                        }
                        if let Some(ref m) = self.metrics {
                            m.record_tick("alert_rules", start.elapsed());
                        }
                    }
                }
            }
        };

        let sweep_loop = async {
            let mut ticker = interval(self.settings.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let start = std::time::Instant::now();
                        if self.settings.resend_active {
                            tokio::select! {
                                _ = token.cancelled() => break,
                                _ = self.replay_active() => {}
                            }
                        }
                        self.sweep_suppression();
                        if let Some(ref m) = self.metrics {
                            m.record_tick("alert_sweep", start.elapsed());
                        }
                    }
                }
            }
        };

        tokio::join!(rule_loop, sweep_loop);
        info!("Alert manager stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Register a rule, replacing any rule with the same id.
    pub fn add_rule(&self, mut rule: AlertRule) -> Result<()> {
        if rule.id.trim().is_empty() {
            return Err(Error::invalid_rule("rule id must not be empty"));
        }
        let condition = Condition::parse(&rule.condition).map_err(|e| {
            Error::invalid_rule(format!("rule '{}': {}", rule.id, e.message()))
        })?;

        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = rules.get(&rule.id) {
            rule.created_at = existing.rule.created_at;
            rule.updated_at = Utc::now();
        }
        info!(
            rule_id = %rule.id,
            condition = %condition,
            level = %rule.level,
            "Alert rule registered"
        );
        rules.insert(
            rule.id.clone(),
            RuleEntry {
                rule,
                condition,
                last_evaluated: None,
            },
        );
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> Result<AlertRule> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let entry = rules.remove(id).ok_or_else(|| {
            Error::not_found(Component::AlertManager, "remove_rule", format!("rule '{}'", id))
        })?;
        info!(rule_id = %id, "Alert rule removed");
        Ok(entry.rule)
    }

    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let entry = rules.get_mut(id).ok_or_else(|| {
            Error::not_found(Component::AlertManager, "set_rule_enabled", format!("rule '{}'", id))
        })?;
        entry.rule.enabled = enabled;
        entry.rule.updated_at = Utc::now();
        info!(rule_id = %id, enabled, "Alert rule toggled");
        Ok(())
    }

    pub fn get_rule(&self, id: &str) -> Option<AlertRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|e| e.rule.clone())
    }

    /// Registered rules ordered by id
    pub fn list_rules(&self) -> Vec<AlertRule> {
        let mut rules: Vec<_> = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.rule.clone())
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    fn rule_count(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Register the built-in resource and application rules.
    pub fn load_default_rules(&self) {
        for rule in default_rules() {
            if let Err(e) = self.add_rule(rule) {
                warn!(error = %e, "Skipping built-in alert rule");
            }
        }
        info!(rules = self.rule_count(), "Loaded default alert rules");
    }

    /// Persist the alert, then process it. A store failure is logged and the
    /// alert is still processed.
    pub async fn raise(&self, mut alert: Alert) -> DispatchOutcome {
        match self.store.create_alert(&alert).await {
            Ok(id) => alert.id = Some(id),
            Err(e) => warn!(alert_type = %alert.alert_type, error = %e, "Failed to persist alert"),
        }
        self.process_alert(&alert).await
    }

    /// Suppress or dispatch one alert.
    pub async fn process_alert(&self, alert: &Alert) -> DispatchOutcome {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        let key = alert.suppression_key();

        // Check and reserve under one write lock so concurrent raises of the
        // same key dispatch once.
        {
            let now = Instant::now();
            let mut table = self.suppression.write().unwrap_or_else(PoisonError::into_inner);
            if table.get(&key).is_some_and(|expiry| *expiry > now) {
                drop(table);
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                if let Some(ref m) = self.metrics {
                    m.record_alert(&alert.source, true);
                }
                debug!(key = %key, "Alert suppressed");
                return DispatchOutcome::Suppressed;
            }
            table.insert(key.clone(), now + self.settings.cooldown);
        }

        let results = join_all(self.notifiers.iter().map(|n| self.deliver(n, alert))).await;
        let delivered = results.iter().filter(|ok| **ok).count();
        let failed = results.len() - delivered;

        self.suppression
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Instant::now() + self.settings.cooldown);

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters
            .delivery_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
        if let Some(ref m) = self.metrics {
            m.record_alert(&alert.source, false);
        }

        info!(
            alert_type = %alert.alert_type,
            source = %alert.source,
            level = %alert.level,
            delivered,
            failed,
            "Alert dispatched"
        );
        DispatchOutcome::Dispatched { delivered, failed }
    }

    async fn deliver(&self, notifier: &Arc<dyn Notifier>, alert: &Alert) -> bool {
        let result = self
            .settings
            .retry
            .run(notifier.name(), |_| notifier.notify(alert))
            .await;

        if let Some(ref m) = self.metrics {
            m.record_delivery(notifier.name(), result.is_ok());
        }
        match result {
            Ok(()) => {
                debug!(
                    channel = notifier.name(),
                    alert_type = %alert.alert_type,
                    "Notification sent"
                );
                true
            }
            Err(e) => {
                warn!(
                    channel = notifier.name(),
                    alert_type = %alert.alert_type,
                    error = %e,
                    "Notification failed"
                );
                false
            }
        }
    }

    /// Evaluate every enabled rule whose interval elapsed against the latest
    /// snapshot, raising an alert for each one that holds. Returns how many
    /// fired.
    pub async fn evaluate_rules(&self) -> usize {
        let Some(snapshot) = self.source.latest().await else {
            debug!("No metrics snapshot yet, skipping rule evaluation");
            return 0;
        };

        let now = Instant::now();
        let fired: Vec<AlertRule> = {
            let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
            rules
                .values_mut()
                .filter(|e| e.rule.enabled)
                .filter(|e| {
                    e.last_evaluated
                        .is_none_or(|at| now.duration_since(at) >= e.rule.interval)
                })
                .filter_map(|e| {
                    e.last_evaluated = Some(now);
                    e.condition.evaluate(&snapshot).then(|| e.rule.clone())
                })
                .collect()
        };

        for rule in &fired {
            debug!(rule_id = %rule.id, "Alert rule condition holds");
            self.raise(rule_alert(rule)).await;
        }
        fired.len()
    }

    /// Drop expired suppression entries, returning how many were removed.
    pub fn sweep_suppression(&self) -> usize {
        let now = Instant::now();
        let mut table = self.suppression.write().unwrap_or_else(PoisonError::into_inner);
        let before = table.len();
        table.retain(|_, expiry| *expiry > now);
        let removed = before - table.len();
        if removed > 0 {
            debug!(removed, remaining = table.len(), "Swept expired suppression entries");
        }
        removed
    }

    /// Re-process the store's active alerts; suppressed keys stay quiet.
    pub async fn replay_active(&self) -> usize {
        let alerts = match self.store.active_alerts().await {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!(error = %e, "Failed to load active alerts");
                return 0;
            }
        };
        let mut dispatched = 0;
        for alert in &alerts {
            if let DispatchOutcome::Dispatched { .. } = self.process_alert(alert).await {
                dispatched += 1;
            }
        }
        debug!(active = alerts.len(), dispatched, "Replayed active alerts");
        dispatched
    }

    pub fn is_suppressed(&self, alert: &Alert) -> bool {
        let now = Instant::now();
        self.suppression
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&alert.suppression_key())
            .is_some_and(|expiry| *expiry > now)
    }

    pub fn status(&self) -> AlertManagerStatus {
        let (rules_count, enabled_rules) = {
            let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
            (rules.len(), rules.values().filter(|e| e.rule.enabled).count())
        };
        AlertManagerStatus {
            running: self.is_running(),
            rules_count,
            enabled_rules,
            notifiers_count: self.notifiers.len(),
            suppression_count: self
                .suppression
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            delivery_failures: self.counters.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl AlertSink for AlertManager {
    async fn create_alert(&self, alert: Alert) {
        self.raise(alert).await;
    }
}

fn rule_alert(rule: &AlertRule) -> Alert {
    Alert::new(
        rule.id.clone(),
        rule.level,
        RULE_SOURCE,
        format!("Rule '{}' triggered: {}", rule.name, rule.description),
    )
}

/// Built-in resource, application and task rules.
pub fn default_rules() -> Vec<AlertRule> {
    let minute = Duration::from_secs(60);
    vec![
        AlertRule::new(
            "high_cpu_usage",
            "High CPU Usage",
            "cpu_usage > 80",
            AlertLevel::Warning,
            minute,
        )
        .with_description("CPU usage exceeds threshold"),
        AlertRule::new(
            "high_memory_usage",
            "High Memory Usage",
            "memory_usage > 85",
            AlertLevel::Warning,
            minute,
        )
        .with_description("Memory usage exceeds threshold"),
        AlertRule::new(
            "high_disk_usage",
            "High Disk Usage",
            "disk_usage > 90",
            AlertLevel::Critical,
            minute,
        )
        .with_description("Disk usage exceeds threshold"),
        AlertRule::new(
            "high_error_rate",
            "High Error Rate",
            "error_rate > 5",
            AlertLevel::Critical,
            minute,
        )
        .with_description("Application error rate exceeds threshold"),
        AlertRule::new(
            "slow_response_time",
            "Slow Response Time",
            "response_time > 1000",
            AlertLevel::Warning,
            minute,
        )
        .with_description("Response time exceeds threshold"),
        AlertRule::new(
            "too_many_failed_tasks",
            "Too Many Failed Tasks",
            "failed_tasks > 10",
            AlertLevel::Critical,
            minute * 5,
        )
        .with_description("Failed tasks count exceeds threshold"),
    ]
}
