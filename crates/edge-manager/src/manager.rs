//! Lifecycle of the four control loops.

use crate::alert_manager::{AlertManager, AlertManagerStatus};
use crate::config::Config;
use crate::handlers::HandlerRegistry;
use crate::health_checker::{HealthChecker, HealthReport, build_checks};
use crate::metrics::MetricsRegistry;
use crate::monitor::{MetricsHistory, Monitor, MonitorStatus, ResourceSampler, SysinfoSampler};
use crate::ports::Services;
use crate::scheduler::{SchedulerStatus, TaskScheduler};
use chrono::{DateTime, Utc};
use common::{Component, Error, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// A supervised loop that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopFailure {
    pub component: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub state: ManagerState,
    pub started_at: Option<DateTime<Utc>>,
    pub scheduler: SchedulerStatus,
    pub monitor: MonitorStatus,
    pub alerts: AlertManagerStatus,
    pub health: HealthReport,
    pub failures: Vec<LoopFailure>,
}

/// The supervised components, already wired together.
pub struct Components {
    pub scheduler: Arc<TaskScheduler>,
    pub monitor: Arc<Monitor>,
    pub alerts: Arc<AlertManager>,
    pub health: Arc<HealthChecker>,
}

impl Components {
    /// Wire every component from configuration.
    ///
    /// Monitor and health checker raise alerts through the alert manager,
    /// which reads snapshots from the monitor's history.
    pub fn build(
        config: &Config,
        services: &Services,
        sampler: Arc<dyn ResourceSampler>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Result<Self> {
        let history = Arc::new(MetricsHistory::new(config.monitor.retention));

        let alerts = Arc::new(AlertManager::from_settings(
            config.alerting.clone(),
            services.alerts.clone(),
            history.clone(),
            metrics.clone(),
        )?);

        let checks = build_checks(&config.health.checks, services, config.health.check_timeout)?;
        let health = Arc::new(HealthChecker::new(
            config.health.clone(),
            checks,
            Some(alerts.clone()),
            metrics.clone(),
        ));

        let monitor = Arc::new(Monitor::new(
            config.monitor.clone(),
            services.clone(),
            sampler,
            alerts.clone(),
            history,
            metrics.clone(),
        ));

        let handlers = HandlerRegistry::standard(
            services,
            health.clone(),
            config.scheduler.cleanup_retention,
        );
        let scheduler = Arc::new(TaskScheduler::new(
            config.scheduler.clone(),
            services.tasks.clone(),
            handlers,
            metrics,
        ));

        Ok(Self {
            scheduler,
            monitor,
            alerts,
            health,
        })
    }
}

/// Supervises the scheduler, monitor, alert manager and health checker.
pub struct Manager {
    components: Components,
    shutdown_timeout: Duration,
    state: watch::Sender<ManagerState>,
    /// Scope of the current run; `None` while stopped
    token: Mutex<Option<CancellationToken>>,
    /// Join bound requested by `stop`, overriding `shutdown_timeout`
    stop_timeout: Mutex<Option<Duration>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    failures: Mutex<Vec<LoopFailure>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Manager {
    /// Build every component from configuration, sampling host resources
    /// through `sysinfo`.
    pub fn new(
        config: &Config,
        services: Services,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Result<Self> {
        let sampler: Arc<dyn ResourceSampler> =
            Arc::new(SysinfoSampler::new(config.monitor.disk_path.clone()));
        let components = Components::build(config, &services, sampler, metrics.clone())?;
        Ok(Self::with_components(
            components,
            config.manager.shutdown_timeout,
            metrics,
        ))
    }

    pub fn with_components(
        components: Components,
        shutdown_timeout: Duration,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        let (state, _) = watch::channel(ManagerState::Stopped);
        Self {
            components,
            shutdown_timeout,
            state,
            token: Mutex::new(None),
            stop_timeout: Mutex::new(None),
            started_at: Mutex::new(None),
            failures: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Run all loops under a child of `parent` until it is cancelled or
    /// [`stop`] is called, then join them within the shutdown timeout.
    ///
    /// [`stop`]: Manager::stop
    pub async fn start(&self, parent: &CancellationToken) -> Result<()> {
        let token = parent.child_token();
        let claimed = self.state.send_if_modified(|state| {
            if *state != ManagerState::Stopped {
                return false;
            }
            *state = ManagerState::Starting;
            *lock(&self.token) = Some(token.clone());
            *lock(&self.stop_timeout) = None;
            true
        });
        if !claimed {
            return Err(Error::already_running(Component::Manager));
        }
        let _reset = ResetOnExit(self);

        *lock(&self.started_at) = Some(Utc::now());
        lock(&self.failures).clear();

        let mut group = JoinSet::new();
        let mut names = HashMap::new();
        let c = &self.components;
        spawn_loop(
            &mut group,
            &mut names,
            "scheduler",
            &token,
            c.scheduler.clone(),
            |s, t| async move { s.run(&t).await },
        );
        spawn_loop(
            &mut group,
            &mut names,
            "monitor",
            &token,
            c.monitor.clone(),
            |m, t| async move { m.run(&t).await },
        );
        spawn_loop(
            &mut group,
            &mut names,
            "alert_manager",
            &token,
            c.alerts.clone(),
            |a, t| async move { a.run(&t).await },
        );
        spawn_loop(
            &mut group,
            &mut names,
            "health_checker",
            &token,
            c.health.clone(),
            |h, t| async move { h.run(&t).await },
        );

        self.state.send_replace(ManagerState::Running);
        info!(loops = group.len(), "Manager started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                joined = group.join_next_with_id() => match joined {
                    Some(joined) => self.record_exit(&names, joined),
                    None => {
                        warn!("Every supervised loop exited");
                        break;
                    }
                },
            }
        }

        self.state.send_replace(ManagerState::Stopping);
        token.cancel();

        let limit = lock(&self.stop_timeout).take().unwrap_or(self.shutdown_timeout);
        let drained = tokio::time::timeout(limit, async {
            while let Some(joined) = group.join_next_with_id().await {
                self.record_exit(&names, joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout_ms = limit.as_millis() as u64,
                remaining = group.len(),
                "Shutdown timed out, aborting remaining loops"
            );
            group.abort_all();
            while let Some(joined) = group.join_next_with_id().await {
                self.record_exit(&names, joined);
            }
        }

        info!("Manager stopped");
        Ok(())
    }

    /// Cancel the running loops and wait for them, bounded by `timeout`.
    ///
    /// A no-op on a stopped manager.
    pub async fn stop(&self, timeout: Duration) {
        let Some(token) = lock(&self.token).clone() else {
            debug!("Stop requested while stopped");
            return;
        };
        *lock(&self.stop_timeout) = Some(timeout);
        token.cancel();

        let mut state = self.state.subscribe();
        // Slack for the final aborts after the join bound expires
        let wait = timeout + Duration::from_secs(1);
        let stopped = tokio::time::timeout(wait, state.wait_for(|s| *s == ManagerState::Stopped))
            .await
            .is_ok_and(|r| r.is_ok());
        if !stopped {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Manager did not report stopped in time"
            );
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.components.scheduler
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.components.monitor
    }

    pub fn alert_manager(&self) -> &Arc<AlertManager> {
        &self.components.alerts
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.components.health
    }

    /// Read every component's status; no cross-component consistency.
    pub async fn status(&self) -> ManagerStatus {
        let c = &self.components;
        ManagerStatus {
            state: self.state(),
            started_at: *lock(&self.started_at),
            scheduler: c.scheduler.status(),
            monitor: c.monitor.status().await,
            alerts: c.alerts.status(),
            health: c.health.health_status().await,
            failures: lock(&self.failures).clone(),
        }
    }

    fn record_exit(
        &self,
        names: &HashMap<Id, &'static str>,
        joined: std::result::Result<(Id, Result<()>), JoinError>,
    ) {
        let name = |id: Id| names.get(&id).copied().unwrap_or("unknown");
        let (component, message) = match joined {
            Ok((id, Ok(()))) => {
                debug!(component = name(id), "Loop exited");
                return;
            }
            Ok((id, Err(e))) => (name(id), e.to_string()),
            Err(e) if e.is_cancelled() => {
                debug!(component = name(e.id()), "Loop aborted");
                return;
            }
            Err(e) => {
                let component = name(e.id());
                match e.try_into_panic() {
                    Ok(payload) => {
                        let message = format!("panicked: {}", panic_message(payload.as_ref()));
                        (component, message)
                    }
                    Err(e) => (component, e.to_string()),
                }
            }
        };

        error!(component, error = %message, "Supervised loop failed");
        if let Some(ref m) = self.metrics {
            m.record_loop_failure(component);
        }
        lock(&self.failures).push(LoopFailure {
            component: component.to_string(),
            message,
            at: Utc::now(),
        });
    }
}

fn spawn_loop<T, F, Fut>(
    group: &mut JoinSet<Result<()>>,
    names: &mut HashMap<Id, &'static str>,
    name: &'static str,
    token: &CancellationToken,
    component: Arc<T>,
    run: F,
) where
    T: Send + Sync + 'static,
    F: FnOnce(Arc<T>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let handle = group.spawn(run(component, token.clone()));
    names.insert(handle.id(), name);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the manager to `stopped` when `start` ends, including when its
/// future is dropped.
struct ResetOnExit<'a>(&'a Manager);

impl Drop for ResetOnExit<'_> {
    fn drop(&mut self) {
        if let Some(token) = lock(&self.0.token).take() {
            token.cancel();
        }
        *lock(&self.0.started_at) = None;
        self.0.state.send_replace(ManagerState::Stopped);
    }
}
