//! Configuration loading and validation for the edge manager

use crate::health_checker::CheckSpec;
use crate::notifier::{ChannelConfig, ChannelSettings};
use crate::types::{AlertRule, ManagedTask};
use common::RetryPolicy;
use common::logging::LogFormat;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in search paths")]
    FileNotFound,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

impl From<ConfigError> for common::Error {
    fn from(err: ConfigError) -> Self {
        common::Error::config(err)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub alerting: AlertingSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub manager: ManagerSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    /// Tasks loaded into the in-memory task store at startup
    #[serde(default)]
    pub tasks: Vec<ManagedTask>,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.scheduler.validate()?;
        self.monitor.validate()?;
        self.alerting.validate()?;
        self.health.validate()?;
        self.manager.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

/// Task scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Dispatcher tick
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_loop_interval")]
    pub interval: Duration,

    #[validate(range(min = 1, max = 256))]
    pub workers: usize,

    #[validate(range(min = 1, max = 100000))]
    pub queue_capacity: usize,

    /// Minimum idle time between two runs of a continuous task
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_positive_duration")]
    pub continuous_gap: Duration,

    /// Upper bound on one task attempt
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_positive_duration")]
    pub task_timeout: Duration,

    #[validate(custom = "validate_retry_policy")]
    pub retry: RetryPolicy,

    /// Retention of `data_cleanup` tasks that do not set their own
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_positive_duration")]
    pub cleanup_retention: Duration,
}

/// Threshold with a warning tier and an optional critical tier.
///
/// A value strictly above a tier breaches it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    #[serde(default)]
    pub critical: Option<f64>,
}

impl Threshold {
    pub fn new(warning: f64, critical: Option<f64>) -> Self {
        Self { warning, critical }
    }
}

/// Monitor thresholds, one per watched metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorThresholds {
    pub cpu_usage: Threshold,
    pub memory_usage: Threshold,
    pub disk_usage: Threshold,
    pub error_rate: Threshold,
    /// Milliseconds
    pub response_time: Threshold,
    pub active_tasks: Threshold,
    pub failed_tasks: Threshold,
    pub queue_size: Threshold,
}

impl MonitorThresholds {
    fn all(&self) -> [Threshold; 8] {
        [
            self.cpu_usage,
            self.memory_usage,
            self.disk_usage,
            self.error_rate,
            self.response_time,
            self.active_tasks,
            self.failed_tasks,
            self.queue_size,
        ]
    }
}

/// Monitor settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MonitorSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_loop_interval")]
    pub interval: Duration,

    /// Snapshots kept in history
    #[validate(range(min = 1, max = 100000))]
    pub retention: usize,

    /// Path whose filesystem is reported as disk usage
    pub disk_path: PathBuf,

    #[validate(custom = "validate_thresholds")]
    pub thresholds: MonitorThresholds,
}

/// Alert manager and notification settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AlertingSettings {
    /// Rule evaluation loop tick
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_loop_interval")]
    pub rule_interval: Duration,

    /// Suppression sweep tick
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_loop_interval")]
    pub sweep_interval: Duration,

    /// How long an alert key stays suppressed after dispatch
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// Re-notify active alerts from the store once their cooldown expired
    pub resend_active: bool,

    /// Register the built-in rules at startup
    pub default_rules: bool,

    /// Additional rules registered at startup
    pub rules: Vec<AlertRule>,

    pub channels: Vec<ChannelSettings>,

    /// Per-channel delivery retry
    #[validate(custom = "validate_retry_policy")]
    pub retry: RetryPolicy,
}

/// Health checker settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_loop_interval")]
    pub interval: Duration,

    /// Default per-check timeout
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_positive_duration")]
    pub check_timeout: Duration,

    /// Slack on top of `check_timeout` before a cycle gives up on stragglers
    #[serde(with = "humantime_serde")]
    pub cycle_grace: Duration,

    /// Raise an alert for every non-healthy result
    pub alert_on_failure: bool,

    #[validate(custom = "validate_checks")]
    pub checks: Vec<CheckSpec>,
}

/// Manager lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ManagerSettings {
    /// Bound on joining the loops when the parent scope is cancelled
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

/// Prometheus endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

/// OpenTelemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub service_name: String,
    pub otlp_endpoint: String,
    pub protocol: OtlpProtocol,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: LogFormat,
}

impl LoggingSettings {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }
}

// Default implementations

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            workers: 10,
            queue_capacity: 1000,
            continuous_gap: Duration::from_secs(60),
            task_timeout: Duration::from_secs(600),
            retry: RetryPolicy::none(),
            cleanup_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            cpu_usage: Threshold::new(80.0, Some(95.0)),
            memory_usage: Threshold::new(85.0, Some(95.0)),
            disk_usage: Threshold::new(85.0, Some(90.0)),
            error_rate: Threshold::new(2.0, Some(5.0)),
            response_time: Threshold::new(1000.0, Some(3000.0)),
            active_tasks: Threshold::new(100.0, None),
            failed_tasks: Threshold::new(5.0, Some(10.0)),
            queue_size: Threshold::new(500.0, Some(900.0)),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            // 24h of snapshots at the default interval
            retention: 2880,
            disk_path: PathBuf::from("/"),
            thresholds: MonitorThresholds::default(),
        }
    }
}

impl Default for AlertingSettings {
    fn default() -> Self {
        Self {
            rule_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
            resend_active: false,
            default_rules: true,
            rules: Vec::new(),
            channels: vec![ChannelSettings {
                enabled: true,
                channel: ChannelConfig::Console,
            }],
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(5),
            cycle_grace: Duration::from_secs(1),
            alert_on_failure: true,
            checks: CheckSpec::defaults(),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9100".to_string(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "edge-manager".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
            protocol: OtlpProtocol::Grpc,
        }
    }
}

// Custom validators

fn validate_loop_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if !(10..=3_600_000).contains(&millis) {
        return Err(ValidationError::new("loop_interval_out_of_range"));
    }
    Ok(())
}

fn validate_positive_duration(duration: &Duration) -> Result<(), ValidationError> {
    if duration.is_zero() {
        return Err(ValidationError::new("duration_must_be_positive"));
    }
    Ok(())
}

fn validate_shutdown_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    let millis = timeout.as_millis();
    if !(100..=300_000).contains(&millis) {
        return Err(ValidationError::new("shutdown_timeout_out_of_range"));
    }
    Ok(())
}

fn validate_retry_policy(policy: &RetryPolicy) -> Result<(), ValidationError> {
    if !(1..=10).contains(&policy.max_attempts) {
        return Err(ValidationError::new("retry_attempts_out_of_range"));
    }
    if policy.multiplier < 1.0 || policy.initial_backoff > policy.max_backoff {
        return Err(ValidationError::new("retry_backoff_invalid"));
    }
    Ok(())
}

fn validate_thresholds(thresholds: &MonitorThresholds) -> Result<(), ValidationError> {
    for threshold in thresholds.all() {
        if threshold.warning < 0.0 {
            return Err(ValidationError::new("threshold_negative"));
        }
        if threshold.critical.is_some_and(|critical| critical < threshold.warning) {
            return Err(ValidationError::new("critical_below_warning"));
        }
    }
    Ok(())
}

fn validate_checks(checks: &[CheckSpec]) -> Result<(), ValidationError> {
    let mut names = std::collections::HashSet::new();
    for check in checks {
        if check.name().trim().is_empty() {
            return Err(ValidationError::new("check_name_empty"));
        }
        if !names.insert(check.name()) {
            return Err(ValidationError::new("check_name_duplicate"));
        }
    }
    Ok(())
}

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::FileNotFound);
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/edge-manager/edge-manager.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./edge-manager.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.exists() && p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/edge-manager/edge-manager.yaml"))
    }
}
