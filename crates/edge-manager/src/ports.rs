//! Service interfaces the control loops consume.
//!
//! Persistence, inference execution and dependency probing live outside the
//! manager. Each collaborator is reached through one of the async traits in
//! this module; [`crate::memory`] ships in-memory implementations.

use crate::types::{
    Alert, AlertId, CacheStats, InferenceRecord, InferenceStatus, ManagedTask, ModelId, ModelInfo,
    PoolStats, SystemMetrics, TaskId, TaskStats, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Result;
use healthcheck::{CycleReport, DependencyProbe};
use std::sync::Arc;

/// Task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks whose operator switch is on
    async fn list_enabled(&self) -> Result<Vec<ManagedTask>>;

    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<()>;

    async fn update_last_run(&self, id: TaskId, at: DateTime<Utc>) -> Result<()>;

    async fn stats(&self) -> Result<TaskStats>;
}

/// Inference execution and its record keeping.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Persist a new record, returning its id
    async fn create_record(&self, record: InferenceRecord) -> Result<u64>;

    async fn run(&self, task: &ManagedTask, model_id: Option<ModelId>) -> Result<()>;

    async fn update_record(
        &self,
        id: u64,
        status: InferenceStatus,
        error: Option<String>,
    ) -> Result<()>;

    /// Delete records started before `cutoff`, returning how many were removed
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Alert persistence.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn create_alert(&self, alert: &Alert) -> Result<AlertId>;

    async fn active_alerts(&self) -> Result<Vec<Alert>>;
}

#[async_trait]
pub trait ModelService: Send + Sync {
    async fn active_models(&self) -> Result<Vec<ModelInfo>>;

    async fn refresh_model(&self, id: ModelId) -> Result<()>;
}

/// Relational store, probed by the `store` health check.
#[async_trait]
pub trait DataStore: DependencyProbe {
    async fn pool_stats(&self) -> Result<PoolStats>;
}

/// Key-value cache, probed by the `cache` health check.
#[async_trait]
pub trait CacheStore: DependencyProbe {
    async fn stats(&self) -> Result<CacheStats>;
}

/// Pool of RPC connections to inference backends.
pub trait RpcPool: DependencyProbe {}

/// Where Monitor and Health Checker report alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn create_alert(&self, alert: Alert);
}

/// Read access to the most recent metrics snapshot.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn latest(&self) -> Option<SystemMetrics>;
}

/// On-demand health check cycle, used by `health_check` tasks.
#[async_trait]
pub trait HealthCycle: Send + Sync {
    async fn check_now(&self) -> CycleReport;
}

/// Every external collaborator the manager is wired with.
///
/// Store, cache and RPC pool are optional; a missing dependency is simply not
/// sampled by the monitor.
#[derive(Clone)]
pub struct Services {
    pub tasks: Arc<dyn TaskStore>,
    pub inference: Arc<dyn InferenceService>,
    pub alerts: Arc<dyn AlertStore>,
    pub models: Arc<dyn ModelService>,
    pub data: Option<Arc<dyn DataStore>>,
    pub cache: Option<Arc<dyn CacheStore>>,
    pub rpc: Option<Arc<dyn RpcPool>>,
}
