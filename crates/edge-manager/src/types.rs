//! Domain types shared by the control loops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Task identifier, assigned by the task store
pub type TaskId = u64;

/// Alert identifier, assigned by the alert store
pub type AlertId = u64;

/// Model identifier, assigned by the model service
pub type ModelId = u64;

/// How a task becomes eligible to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Runs on an interval or cron recurrence
    Scheduled,
    /// Runs again as soon as it has been idle for the minimum gap
    Continuous,
    /// Runs only after a manual trigger
    Triggered,
}

/// What a task does when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Inference,
    ModelUpdate,
    DataCleanup,
    HealthCheck,
}

impl TaskAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskAction::Inference => "inference",
            TaskAction::ModelUpdate => "model_update",
            TaskAction::DataCleanup => "data_cleanup",
            TaskAction::HealthCheck => "health_check",
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Enabled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether a task in this status may be offered to the queue.
    ///
    /// Terminal states are re-eligible; `running` and `cancelled` never are.
    pub fn is_eligible(self) -> bool {
        matches!(
            self,
            TaskStatus::Enabled | TaskStatus::Completed | TaskStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Enabled => "enabled",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recurrence of a scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    Interval {
        #[serde(with = "humantime_serde")]
        every: Duration,
    },
    /// Five-field (minute precision) or six-field (second precision)
    /// cron expression
    Cron { expression: String },
}

/// A task owned by the external task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedTask {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub action: TaskAction,
    pub status: TaskStatus,

    /// Operator switch, the store only lists enabled tasks
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,

    /// Action parameters
    #[serde(default)]
    pub params: serde_json::Value,

    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl ManagedTask {
    pub fn new(id: TaskId, name: impl Into<String>, kind: TaskKind, action: TaskAction) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            action,
            status: TaskStatus::Enabled,
            enabled: true,
            recurrence: None,
            params: serde_json::Value::Null,
            last_run: None,
        }
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Aggregate task statistics reported by the task store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub active_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub queue_size: u64,
    /// Failed share of finished tasks, in percent
    pub error_rate: f64,
    /// Average execution time in milliseconds
    pub avg_response_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStatus {
    Running,
    Completed,
    Failed,
}

/// One inference execution, persisted by the inference service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRecord {
    pub id: Option<u64>,
    pub task_id: TaskId,
    pub model_id: Option<ModelId>,
    pub status: InferenceStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: ModelId,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub open_connections: u64,
    pub in_use: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub key_count: u64,
    pub hit_rate: f64,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Suppressed,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Suppressed => "suppressed",
            AlertStatus::Resolved => "resolved",
        }
    }
}

/// An alert raised by a control loop or a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Assigned by the alert store on persistence
    pub id: Option<AlertId>,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub level: AlertLevel,
    pub message: String,
    pub source: String,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: impl Into<String>,
        level: AlertLevel,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            alert_type: alert_type.into(),
            level,
            message: message.into(),
            source: source.into(),
            status: AlertStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// Suppression key, one cooldown window per `(type, source)` pair.
    pub fn suppression_key(&self) -> String {
        format!("{}:{}", self.alert_type, self.source)
    }
}

/// A condition evaluated periodically against the latest metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Condition expression, e.g. `cpu_usage > 80 && memory_usage > 70`
    pub condition: String,
    pub level: AlertLevel,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        condition: impl Into<String>,
        level: AlertLevel,
        interval: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            condition: condition.into(),
            level,
            enabled: true,
            interval,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Host resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    /// Live tokio tasks
    pub task_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMetrics {
    pub active_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub queue_size: u64,
    pub error_rate: f64,
    pub response_time: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreMetrics {
    pub connections: u64,
    pub in_use: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub ok: bool,
    pub key_count: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub active_models: u64,
}

/// One monitor collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub resource: ResourceMetrics,
    pub application: ApplicationMetrics,
    pub store: StoreMetrics,
    pub cache: CacheMetrics,
    pub models: ModelMetrics,
}

impl SystemMetrics {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            resource: ResourceMetrics::default(),
            application: ApplicationMetrics::default(),
            store: StoreMetrics::default(),
            cache: CacheMetrics::default(),
            models: ModelMetrics::default(),
        }
    }
}
