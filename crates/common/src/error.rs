//! Structured error type for the edge platform components.
//!
//! Every failure carries a closed [`ErrorKind`], the [`Component`] and
//! operation where it happened, and a [`Severity`]. Errors are built through
//! [`Error::new`] or one of the per-kind helpers.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// A specialized Result type for edge platform operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error used as the optional underlying cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Closed taxonomy of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// `start` called on a component that is not stopped.
    AlreadyRunning,
    /// Operation requires a running component.
    NotRunning,
    /// Graceful shutdown did not finish in time.
    ShutdownTimeout,
    /// Invalid or missing configuration.
    Config,
    /// An external dependency (store, cache, RPC pool, service) failed.
    Dependency,
    /// A managed task failed while executing.
    TaskExecution,
    /// A notification channel failed to deliver.
    Notification,
    /// An operation exceeded its deadline.
    Timeout,
    /// An alert rule could not be parsed or evaluated.
    InvalidRule,
    /// A task recurrence could not be parsed.
    InvalidSchedule,
    /// The referenced entity does not exist.
    NotFound,
    /// Local I/O failure.
    Io,
    /// Encoding or decoding failure.
    Serialization,
    /// A supervised loop panicked or was aborted.
    Internal,
}

impl ErrorKind {
    /// Severity used when the caller does not override it.
    pub fn default_severity(self) -> Severity {
        match self {
            ErrorKind::AlreadyRunning | ErrorKind::NotRunning | ErrorKind::NotFound => {
                Severity::Low
            }
            ErrorKind::Notification | ErrorKind::Timeout | ErrorKind::InvalidRule => {
                Severity::Medium
            }
            ErrorKind::InvalidSchedule | ErrorKind::TaskExecution | ErrorKind::Dependency => {
                Severity::Medium
            }
            ErrorKind::ShutdownTimeout
            | ErrorKind::Config
            | ErrorKind::Io
            | ErrorKind::Serialization => Severity::High,
            ErrorKind::Internal => Severity::Critical,
        }
    }

    /// Stable snake_case name, used as a metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::NotRunning => "not_running",
            ErrorKind::ShutdownTimeout => "shutdown_timeout",
            ErrorKind::Config => "config",
            ErrorKind::Dependency => "dependency",
            ErrorKind::TaskExecution => "task_execution",
            ErrorKind::Notification => "notification",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidRule => "invalid_rule",
            ErrorKind::InvalidSchedule => "invalid_schedule",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component in which an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Manager,
    Scheduler,
    Monitor,
    AlertManager,
    HealthChecker,
    Notifier,
    Config,
    Store,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Manager => "manager",
            Component::Scheduler => "scheduler",
            Component::Monitor => "monitor",
            Component::AlertManager => "alert_manager",
            Component::HealthChecker => "health_checker",
            Component::Notifier => "notifier",
            Component::Config => "config",
            Component::Store => "store",
        };
        f.write_str(name)
    }
}

/// How bad an error is for the platform as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Common error type for edge platform operations.
#[derive(Debug, thiserror::Error)]
#[error("{component}/{operation}: {kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    component: Component,
    operation: Cow<'static, str>,
    severity: Severity,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl Error {
    /// Create a new error. Severity defaults to the kind's default.
    pub fn new(
        kind: ErrorKind,
        component: Component,
        operation: impl Into<Cow<'static, str>>,
        message: impl fmt::Display,
    ) -> Self {
        Self {
            kind,
            component,
            operation: operation.into(),
            severity: kind.default_severity(),
            message: message.to_string(),
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Override the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Dependency | ErrorKind::Timeout | ErrorKind::Notification
        )
    }

    /// `start` was called while the component was not stopped.
    pub fn already_running(component: Component) -> Self {
        Self::new(
            ErrorKind::AlreadyRunning,
            component,
            "start",
            format!("{} is already running", component),
        )
    }

    /// An external dependency failed.
    pub fn dependency(
        component: Component,
        operation: impl Into<Cow<'static, str>>,
        msg: impl fmt::Display,
    ) -> Self {
        Self::new(ErrorKind::Dependency, component, operation, msg)
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Config, Component::Config, "load", msg)
    }

    /// A task action failed.
    pub fn task(operation: impl Into<Cow<'static, str>>, msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::TaskExecution, Component::Scheduler, operation, msg)
    }

    /// A notification channel failed.
    pub fn notification(channel: impl Into<Cow<'static, str>>, msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Notification, Component::Notifier, channel, msg)
    }

    /// An operation ran past its deadline.
    pub fn timeout(
        component: Component,
        operation: impl Into<Cow<'static, str>>,
        after: std::time::Duration,
    ) -> Self {
        Self::new(
            ErrorKind::Timeout,
            component,
            operation,
            format!("timed out after {:?}", after),
        )
    }

    /// An alert rule is malformed.
    pub fn invalid_rule(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InvalidRule, Component::AlertManager, "parse_rule", msg)
    }

    /// A task recurrence is malformed.
    pub fn invalid_schedule(msg: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::InvalidSchedule,
            Component::Scheduler,
            "parse_schedule",
            msg,
        )
    }

    /// The referenced entity does not exist.
    pub fn not_found(
        component: Component,
        operation: impl Into<Cow<'static, str>>,
        what: impl fmt::Display,
    ) -> Self {
        Self::new(ErrorKind::NotFound, component, operation, format!("{} not found", what))
    }

    /// A supervised loop panicked or was aborted.
    pub fn internal(component: Component, msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Internal, component, "supervise", msg)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, Component::Store, "io", err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, Component::Store, "json", err.to_string())
            .with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_display_includes_context() {
        let err = Error::dependency(Component::Monitor, "task_stats", "connection refused");
        assert_eq!(
            err.to_string(),
            "monitor/task_stats: dependency: connection refused"
        );
        assert_eq!(err.kind(), ErrorKind::Dependency);
        assert_eq!(err.severity(), Severity::Medium);
        assert!(err.is_transient());
    }

    #[test]
    fn test_already_running() {
        let err = Error::already_running(Component::Manager);
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
        assert_eq!(err.operation(), "start");
        assert!(err.message().contains("already running"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_severity_override_and_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = Error::new(ErrorKind::Io, Component::Store, "write", "flush failed")
            .with_source(io)
            .with_severity(Severity::Critical);
        assert_eq!(err.severity(), Severity::Critical);
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("disk gone"));
    }

    #[test]
    fn test_from_serde_json() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Serialization);
        assert_eq!(err.severity(), Severity::High);
    }

    #[test]
    fn test_kind_labels_are_snake_case() {
        assert_eq!(ErrorKind::ShutdownTimeout.as_str(), "shutdown_timeout");
        assert_eq!(Component::AlertManager.to_string(), "alert_manager");
    }
}
