//! Edge Manager - supervisor for an edge AI inference node
//!
//! Runs four cooperating background loops under one lifecycle and keeps the
//! node's work, resources and alerting in step.
//!
//! # Components
//!
//! - **Task Scheduler**: decides which managed tasks are due and runs them on
//!   a bounded worker pool
//! - **Monitor**: samples host and application metrics, keeps a bounded
//!   history and raises threshold alerts
//! - **Alert Manager**: evaluates alert rules, suppresses duplicates within a
//!   cooldown and fans alerts out to notification channels
//! - **Health Checker**: probes dependencies and host resources and reports an
//!   aggregate status
//!
//! The [`Manager`] starts them together, records loop failures and joins them
//! within a shutdown timeout.

pub mod alert_manager;
pub mod config;
pub mod handlers;
pub mod health_checker;
pub mod http_server;
mod lifecycle;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod monitor;
pub mod notifier;
pub mod ports;
pub mod rules;
pub mod schedule;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod types;

pub use alert_manager::{AlertManager, AlertManagerStatus, DispatchOutcome};
pub use config::{Config, ConfigError};
pub use health_checker::{CheckSpec, HealthChecker, HealthReport};
pub use http_server::MetricsServer;
pub use manager::{Components, Manager, ManagerState, ManagerStatus};
pub use metrics::MetricsRegistry;
pub use monitor::{MetricsHistory, Monitor, MonitorStatus};
pub use scheduler::{SchedulerStatus, TaskScheduler, TickSummary};
pub use server::EdgeManagerServer;
pub use telemetry::{TelemetryGuard, init_tracing};
