//! Task action handlers.

use crate::ports::{HealthCycle, InferenceService, ModelService, Services};
use crate::types::{InferenceRecord, InferenceStatus, ManagedTask, ModelId, TaskAction};
use async_trait::async_trait;
use chrono::Utc;
use common::{Error, Result};
use healthcheck::HealthStatus;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Executes one task action.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &ManagedTask) -> Result<()>;
}

/// Parameters read from a task's `params` JSON. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskParams {
    #[serde(default)]
    pub model_id: Option<ModelId>,

    /// Data cleanup retention, e.g. `"7d"`
    #[serde(default, with = "humantime_serde")]
    pub retention: Option<Duration>,
}

impl TaskParams {
    pub fn from_task(task: &ManagedTask) -> Result<Self> {
        if task.params.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(task.params.clone()).map_err(|e| {
            Error::task(
                "parse_params",
                format!("task {} has invalid params: {}", task.id, e),
            )
        })
    }
}

/// Handlers keyed by action.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskAction, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in actions wired to `services`.
    pub fn standard(
        services: &Services,
        health: Arc<dyn HealthCycle>,
        default_retention: Duration,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(
            TaskAction::Inference,
            Arc::new(InferenceHandler {
                inference: services.inference.clone(),
            }),
        );
        registry.register(
            TaskAction::ModelUpdate,
            Arc::new(ModelUpdateHandler {
                models: services.models.clone(),
            }),
        );
        registry.register(
            TaskAction::DataCleanup,
            Arc::new(DataCleanupHandler {
                inference: services.inference.clone(),
                default_retention,
            }),
        );
        registry.register(TaskAction::HealthCheck, Arc::new(HealthCheckHandler { health }));
        registry
    }

    pub fn register(&mut self, action: TaskAction, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(action, handler);
    }

    pub fn get(&self, action: TaskAction) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&action).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Runs an inference and keeps its record in step.
pub struct InferenceHandler {
    inference: Arc<dyn InferenceService>,
}

#[async_trait]
impl TaskHandler for InferenceHandler {
    async fn execute(&self, task: &ManagedTask) -> Result<()> {
        let params = TaskParams::from_task(task)?;
        let record_id = self
            .inference
            .create_record(InferenceRecord {
                id: None,
                task_id: task.id,
                model_id: params.model_id,
                status: InferenceStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                error: None,
            })
            .await?;

        let outcome = self.inference.run(task, params.model_id).await;
        let (status, error) = match &outcome {
            Ok(()) => (InferenceStatus::Completed, None),
            Err(e) => (InferenceStatus::Failed, Some(e.to_string())),
        };
        self.inference.update_record(record_id, status, error).await?;

        debug!(task_id = task.id, record_id, ok = outcome.is_ok(), "Inference finished");
        outcome
    }
}

pub struct ModelUpdateHandler {
    models: Arc<dyn ModelService>,
}

#[async_trait]
impl TaskHandler for ModelUpdateHandler {
    async fn execute(&self, task: &ManagedTask) -> Result<()> {
        let model_id = TaskParams::from_task(task)?.model_id.ok_or_else(|| {
            Error::task("model_update", format!("task {} has no model_id", task.id))
        })?;
        self.models.refresh_model(model_id).await?;
        info!(task_id = task.id, model_id, "Model refreshed");
        Ok(())
    }
}

/// Purges inference records older than the retention.
pub struct DataCleanupHandler {
    inference: Arc<dyn InferenceService>,
    default_retention: Duration,
}

#[async_trait]
impl TaskHandler for DataCleanupHandler {
    async fn execute(&self, task: &ManagedTask) -> Result<()> {
        let retention = TaskParams::from_task(task)?
            .retention
            .unwrap_or(self.default_retention);
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| Error::task("data_cleanup", format!("retention out of range: {}", e)))?;

        let cutoff = Utc::now() - retention;
        let purged = self.inference.purge_before(cutoff).await?;
        info!(task_id = task.id, purged, cutoff = %cutoff, "Old inference records purged");
        Ok(())
    }
}

/// Runs an on-demand health check cycle.
pub struct HealthCheckHandler {
    health: Arc<dyn HealthCycle>,
}

#[async_trait]
impl TaskHandler for HealthCheckHandler {
    async fn execute(&self, task: &ManagedTask) -> Result<()> {
        let report = self.health.check_now().await;
        if report.overall == HealthStatus::Unhealthy {
            let failing: Vec<_> = report
                .results
                .iter()
                .filter(|r| r.status == HealthStatus::Unhealthy)
                .map(|r| r.name.as_str())
                .collect();
            return Err(Error::task(
                "health_check",
                format!("system unhealthy, failing checks: {}", failing.join(", ")),
            ));
        }
        debug!(task_id = task.id, overall = %report.overall, "Health check task passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackends, MemoryModelService};
    use crate::types::{ModelInfo, TaskKind};
    use common::ErrorKind;
    use healthcheck::{CycleReport, HealthCheckResult};
    use serde_json::json;

    struct FixedHealth(HealthStatus);

    #[async_trait]
    impl HealthCycle for FixedHealth {
        async fn check_now(&self) -> CycleReport {
            let result = match self.0 {
                HealthStatus::Unhealthy => {
                    HealthCheckResult::unhealthy("database", Duration::ZERO, "down", None)
                }
                _ => HealthCheckResult::healthy("database", Duration::ZERO, "ok"),
            };
            CycleReport {
                overall: self.0,
                results: vec![result],
                missing: Vec::new(),
                duration: Duration::ZERO,
                completed_at: Utc::now(),
            }
        }
    }

    fn registry(backends: &MemoryBackends, health: HealthStatus) -> HandlerRegistry {
        HandlerRegistry::standard(
            &backends.services(),
            Arc::new(FixedHealth(health)),
            Duration::from_secs(7 * 24 * 3600),
        )
    }

    fn task(action: TaskAction, params: serde_json::Value) -> ManagedTask {
        ManagedTask::new(7, "job", TaskKind::Triggered, action).with_params(params)
    }

    #[test]
    fn test_params_parsing() {
        let params = TaskParams::from_task(&task(
            TaskAction::DataCleanup,
            json!({"retention": "3d", "note": "ignored"}),
        ))
        .unwrap();
        assert_eq!(params.retention, Some(Duration::from_secs(3 * 24 * 3600)));

        let err = TaskParams::from_task(&task(TaskAction::Inference, json!({"model_id": "x"})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskExecution);
    }

    #[tokio::test]
    async fn test_inference_updates_record() {
        let backends = MemoryBackends::new();
        let registry = registry(&backends, HealthStatus::Healthy);
        let handler = registry.get(TaskAction::Inference).unwrap();

        handler
            .execute(&task(TaskAction::Inference, json!({"model_id": 3})))
            .await
            .unwrap();

        backends.inference.set_failing(true);
        assert!(handler.execute(&task(TaskAction::Inference, json!(null))).await.is_err());

        let records = backends.inference.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, InferenceStatus::Completed);
        assert_eq!(records[0].model_id, Some(3));
        assert_eq!(records[1].status, InferenceStatus::Failed);
        assert!(records[1].error.is_some());
    }

    #[tokio::test]
    async fn test_model_update_needs_model() {
        let backends = MemoryBackends::new();
        backends.models.register(ModelInfo {
            id: 11,
            name: "yolo".to_string(),
            version: "v8".to_string(),
        });
        let handler = registry(&backends, HealthStatus::Healthy)
            .get(TaskAction::ModelUpdate)
            .unwrap();

        assert!(handler.execute(&task(TaskAction::ModelUpdate, json!({}))).await.is_err());
        handler
            .execute(&task(TaskAction::ModelUpdate, json!({"model_id": 11})))
            .await
            .unwrap();
        assert_eq!(backends.models.refresh_count(11), 1);

        let unknown = MemoryModelService::new();
        assert!(unknown.refresh_model(11).await.is_err());
    }

    #[tokio::test]
    async fn test_health_check_fails_when_unhealthy() {
        let backends = MemoryBackends::new();
        let healthy = registry(&backends, HealthStatus::Degraded);
        let unhealthy = registry(&backends, HealthStatus::Unhealthy);
        let job = task(TaskAction::HealthCheck, json!(null));

        assert!(healthy.get(TaskAction::HealthCheck).unwrap().execute(&job).await.is_ok());
        let err = unhealthy
            .get(TaskAction::HealthCheck)
            .unwrap()
            .execute(&job)
            .await
            .unwrap_err();
        assert!(err.message().contains("database"));
    }
}
