//! In-memory implementations of the service ports.
//!
//! They back the standalone binary and the tests. Nothing here survives a
//! restart.

use crate::ports::{
    AlertStore, CacheStore, DataStore, InferenceService, ModelService, RpcPool, Services,
    TaskStore,
};
use crate::types::{
    Alert, AlertId, AlertStatus, CacheStats, InferenceRecord, InferenceStatus, ManagedTask,
    ModelId, ModelInfo, PoolStats, TaskId, TaskStats, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Component, Error, Result};
use dashmap::DashMap;
use healthcheck::DependencyProbe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Task store keyed by task id.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: DashMap<TaskId, ManagedTask>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: ManagedTask) {
        self.tasks.insert(task.id, task);
    }

    pub fn get(&self, id: TaskId) -> Option<ManagedTask> {
        self.tasks.get(&id).map(|t| t.clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_enabled(&self) -> Result<Vec<ManagedTask>> {
        let mut tasks: Vec<ManagedTask> = self
            .tasks
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        let mut task = self.tasks.get_mut(&id).ok_or_else(|| {
            Error::not_found(Component::Store, "update_status", format!("task {}", id))
        })?;
        task.status = status;
        Ok(())
    }

    async fn update_last_run(&self, id: TaskId, at: DateTime<Utc>) -> Result<()> {
        let mut task = self.tasks.get_mut(&id).ok_or_else(|| {
            Error::not_found(Component::Store, "update_last_run", format!("task {}", id))
        })?;
        task.last_run = Some(at);
        Ok(())
    }

    async fn stats(&self) -> Result<TaskStats> {
        let mut stats = TaskStats::default();
        for task in self.tasks.iter() {
            match task.status {
                TaskStatus::Running => stats.active_tasks += 1,
                TaskStatus::Completed => stats.completed_tasks += 1,
                TaskStatus::Failed => stats.failed_tasks += 1,
                TaskStatus::Enabled | TaskStatus::Cancelled => {}
            }
        }
        let finished = stats.completed_tasks + stats.failed_tasks;
        if finished > 0 {
            stats.error_rate = stats.failed_tasks as f64 / finished as f64 * 100.0;
        }
        Ok(stats)
    }
}

/// Inference service that records executions without running a model.
#[derive(Default)]
pub struct MemoryInferenceService {
    records: DashMap<u64, InferenceRecord>,
    next_id: AtomicU64,
    failing: AtomicBool,
}

impl MemoryInferenceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `run` fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<InferenceRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

#[async_trait]
impl InferenceService for MemoryInferenceService {
    async fn create_record(&self, mut record: InferenceRecord) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        record.id = Some(id);
        self.records.insert(id, record);
        Ok(id)
    }

    async fn run(&self, task: &ManagedTask, model_id: Option<ModelId>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::task(
                "inference",
                format!("inference for task {} failed (model {:?})", task.id, model_id),
            ));
        }
        Ok(())
    }

    async fn update_record(
        &self,
        id: u64,
        status: InferenceStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut record = self.records.get_mut(&id).ok_or_else(|| {
            Error::not_found(Component::Store, "update_record", format!("inference record {}", id))
        })?;
        record.status = status;
        record.error = error;
        record.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.records.len();
        self.records.retain(|_, r| r.started_at >= cutoff);
        Ok((before - self.records.len()) as u64)
    }
}

/// Bound on the rows a [`MemoryAlertStore`] keeps by default.
pub const DEFAULT_ALERT_CAPACITY: usize = 1024;

/// Alert store assigning sequential ids.
///
/// A repeat of an active `(type, source)` alert refreshes the existing row.
/// Past the capacity the oldest rows are evicted.
pub struct MemoryAlertStore {
    alerts: DashMap<AlertId, Alert>,
    /// Active row per suppression key
    active_by_key: DashMap<String, AlertId>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for MemoryAlertStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ALERT_CAPACITY)
    }
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            alerts: DashMap::new(),
            active_by_key: DashMap::new(),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<_> = self.alerts.iter().map(|a| a.clone()).collect();
        alerts.sort_by_key(|a| a.id);
        alerts
    }

    pub fn resolve(&self, id: AlertId) -> Result<()> {
        let mut alert = self
            .alerts
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(Component::Store, "resolve", format!("alert {}", id)))?;
        alert.status = AlertStatus::Resolved;
        let key = alert.suppression_key();
        drop(alert);
        self.active_by_key.remove_if(&key, |_, active| *active == id);
        Ok(())
    }

    fn evict_overflow(&self) {
        while self.alerts.len() > self.capacity {
            let Some(oldest) = self.alerts.iter().map(|a| *a.key()).min() else {
                break;
            };
            if let Some((id, alert)) = self.alerts.remove(&oldest) {
                self.active_by_key
                    .remove_if(&alert.suppression_key(), |_, active| *active == id);
            }
        }
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn create_alert(&self, alert: &Alert) -> Result<AlertId> {
        if alert.status != AlertStatus::Active {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.alerts.insert(id, Alert { id: Some(id), ..alert.clone() });
            self.evict_overflow();
            return Ok(id);
        }

        // Ids start at 1, so 0 marks a key without a live row
        let mut slot = self.active_by_key.entry(alert.suppression_key()).or_insert(0);
        if let Some(mut existing) = self.alerts.get_mut(&*slot) {
            if existing.status == AlertStatus::Active {
                existing.level = alert.level;
                existing.message = alert.message.clone();
                existing.created_at = alert.created_at;
                return Ok(*slot);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        *slot = id;
        self.alerts.insert(id, Alert { id: Some(id), ..alert.clone() });
        drop(slot);
        self.evict_overflow();
        Ok(id)
    }

    async fn active_alerts(&self) -> Result<Vec<Alert>> {
        let mut active: Vec<_> = self
            .alerts
            .iter()
            .filter(|a| a.status == AlertStatus::Active)
            .map(|a| a.clone())
            .collect();
        active.sort_by_key(|a| a.id);
        Ok(active)
    }
}

#[derive(Default)]
pub struct MemoryModelService {
    models: DashMap<ModelId, ModelInfo>,
    refreshed: DashMap<ModelId, u64>,
}

impl MemoryModelService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, model: ModelInfo) {
        self.models.insert(model.id, model);
    }

    /// How many times `id` was refreshed.
    pub fn refresh_count(&self, id: ModelId) -> u64 {
        self.refreshed.get(&id).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl ModelService for MemoryModelService {
    async fn active_models(&self) -> Result<Vec<ModelInfo>> {
        let mut models: Vec<_> = self.models.iter().map(|m| m.clone()).collect();
        models.sort_by_key(|m| m.id);
        Ok(models)
    }

    async fn refresh_model(&self, id: ModelId) -> Result<()> {
        if !self.models.contains_key(&id) {
            return Err(Error::not_found(
                Component::Store,
                "refresh_model",
                format!("model {}", id),
            ));
        }
        *self.refreshed.entry(id).or_insert(0) += 1;
        Ok(())
    }
}

/// Dependency whose reachability can be flipped at runtime.
///
/// Implements every dependency port so one type backs the store, cache and
/// RPC pool.
pub struct MemoryDependency {
    name: &'static str,
    reachable: AtomicBool,
    working: AtomicBool,
}

impl MemoryDependency {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            reachable: AtomicBool::new(true),
            working: AtomicBool::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_working(&self, working: bool) {
        self.working.store(working, Ordering::SeqCst);
    }

    fn ensure_reachable(&self, op: &'static str) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::dependency(
                Component::Store,
                op,
                format!("{} unreachable", self.name),
            ))
        }
    }
}

#[async_trait]
impl DependencyProbe for MemoryDependency {
    async fn connect(&self) -> Result<()> {
        self.ensure_reachable("connect")
    }

    async fn exercise(&self) -> Result<()> {
        self.ensure_reachable("exercise")?;
        if self.working.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::dependency(
                Component::Store,
                "exercise",
                format!("{} rejected the probe operation", self.name),
            ))
        }
    }
}

#[async_trait]
impl DataStore for MemoryDependency {
    async fn pool_stats(&self) -> Result<PoolStats> {
        self.ensure_reachable("pool_stats")?;
        Ok(PoolStats {
            open_connections: 1,
            in_use: 0,
        })
    }
}

#[async_trait]
impl CacheStore for MemoryDependency {
    async fn stats(&self) -> Result<CacheStats> {
        self.ensure_reachable("cache_stats")?;
        Ok(CacheStats::default())
    }
}

impl RpcPool for MemoryDependency {}

/// Handles to every in-memory backend behind a [`Services`] bundle.
#[derive(Clone)]
pub struct MemoryBackends {
    pub tasks: Arc<MemoryTaskStore>,
    pub inference: Arc<MemoryInferenceService>,
    pub alerts: Arc<MemoryAlertStore>,
    pub models: Arc<MemoryModelService>,
    pub data: Arc<MemoryDependency>,
    pub cache: Arc<MemoryDependency>,
    pub rpc: Arc<MemoryDependency>,
}

impl Default for MemoryBackends {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackends {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(MemoryTaskStore::new()),
            inference: Arc::new(MemoryInferenceService::new()),
            alerts: Arc::new(MemoryAlertStore::new()),
            models: Arc::new(MemoryModelService::new()),
            data: Arc::new(MemoryDependency::new("database")),
            cache: Arc::new(MemoryDependency::new("redis")),
            rpc: Arc::new(MemoryDependency::new("grpc")),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            tasks: self.tasks.clone(),
            inference: self.inference.clone(),
            alerts: self.alerts.clone(),
            models: self.models.clone(),
            data: Some(self.data.clone()),
            cache: Some(self.cache.clone()),
            rpc: Some(self.rpc.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertLevel, TaskAction, TaskKind};

    #[tokio::test]
    async fn test_list_enabled_filters_switch() {
        let store = MemoryTaskStore::new();
        store.insert(ManagedTask::new(2, "b", TaskKind::Continuous, TaskAction::Inference));
        let mut off = ManagedTask::new(1, "a", TaskKind::Continuous, TaskAction::Inference);
        off.enabled = false;
        store.insert(off);

        let listed = store.list_enabled().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, 2);
    }

    #[tokio::test]
    async fn test_task_stats_error_rate() {
        let store = MemoryTaskStore::new();
        for (id, status) in [
            (1, TaskStatus::Completed),
            (2, TaskStatus::Completed),
            (3, TaskStatus::Failed),
            (4, TaskStatus::Running),
        ] {
            let mut t = ManagedTask::new(id, "t", TaskKind::Continuous, TaskAction::Inference);
            t.status = status;
            store.insert(t);
        }
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.active_tasks, 1);
        assert_eq!(stats.failed_tasks, 1);
        assert!((stats.error_rate - 33.333).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_update_unknown_task_is_not_found() {
        let store = MemoryTaskStore::new();
        let err = store.update_status(99, TaskStatus::Running).await.unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_alert_store_assigns_ids_and_filters_active() {
        let store = MemoryAlertStore::new();
        let a = Alert::new("a", AlertLevel::Info, "test", "one");
        let b = Alert::new("b", AlertLevel::Info, "test", "two");
        let first = store.create_alert(&a).await.unwrap();
        let second = store.create_alert(&b).await.unwrap();
        assert_eq!((first, second), (1, 2));

        store.resolve(first).unwrap();
        let active = store.active_alerts().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, Some(2));

        // A resolved key opens a new row
        assert_eq!(store.create_alert(&a).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_repeated_alert_refreshes_active_row() {
        let store = MemoryAlertStore::new();
        let mut alert = Alert::new("high_cpu_usage", AlertLevel::Warning, "system_monitor", "85%");
        let first = store.create_alert(&alert).await.unwrap();

        alert.level = AlertLevel::Critical;
        alert.message = "97%".to_string();
        for _ in 0..10 {
            assert_eq!(store.create_alert(&alert).await.unwrap(), first);
        }

        assert_eq!(store.len(), 1);
        let active = store.active_alerts().await.unwrap();
        assert_eq!(active[0].level, AlertLevel::Critical);
        assert_eq!(active[0].message, "97%");
    }

    #[tokio::test]
    async fn test_alert_store_evicts_oldest_past_capacity() {
        let store = MemoryAlertStore::with_capacity(3);
        for i in 0..5 {
            let alert = Alert::new(format!("alert-{}", i), AlertLevel::Info, "test", "x");
            store.create_alert(&alert).await.unwrap();
        }

        let ids: Vec<_> = store.alerts().iter().map(|a| a.id).collect();
        assert_eq!(ids, [Some(3), Some(4), Some(5)]);

        // The evicted key is no longer tied to a row
        let first = Alert::new("alert-0", AlertLevel::Info, "test", "x");
        assert_eq!(store.create_alert(&first).await.unwrap(), 6);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_dependency_probe_flags() {
        let dep = MemoryDependency::new("redis");
        assert!(dep.connect().await.is_ok());
        dep.set_working(false);
        assert!(dep.connect().await.is_ok());
        assert!(dep.exercise().await.is_err());
        dep.set_reachable(false);
        assert!(dep.connect().await.is_err());
        assert!(CacheStore::stats(&dep).await.is_err());
    }
}
