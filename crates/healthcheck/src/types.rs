//! Health check types and structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Dependency is fully usable
    Healthy,
    /// Dependency answers but is impaired
    Degraded,
    /// Dependency is unusable or did not answer in time
    Unhealthy,
    /// No cycle has completed yet
    Unknown,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one probe in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Name of the check that produced this result
    pub name: String,

    pub status: HealthStatus,

    /// Human readable summary
    pub message: String,

    /// Underlying error, if the probe failed
    pub error: Option<String>,

    /// Time spent in the probe
    #[serde(with = "humantime_serde")]
    pub latency: Duration,

    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub(crate) fn with_status(
        name: impl Into<String>,
        status: HealthStatus,
        latency: Duration,
        message: impl Into<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            error,
            latency,
            timestamp: Utc::now(),
        }
    }

    /// Create a healthy result
    pub fn healthy(name: impl Into<String>, latency: Duration, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, latency, message, None)
    }

    /// Create a degraded result
    pub fn degraded(
        name: impl Into<String>,
        latency: Duration,
        message: impl Into<String>,
        error: Option<String>,
    ) -> Self {
        Self::with_status(name, HealthStatus::Degraded, latency, message, error)
    }

    /// Create an unhealthy result
    pub fn unhealthy(
        name: impl Into<String>,
        latency: Duration,
        message: impl Into<String>,
        error: Option<String>,
    ) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, latency, message, error)
    }

    /// Result for a probe that exceeded its own timeout.
    pub fn timed_out(name: impl Into<String>, after: Duration) -> Self {
        Self::unhealthy(
            name,
            after,
            "Health check timed out",
            Some(format!("no answer within {:?}", after)),
        )
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Combine per-check results into one overall status.
///
/// Healthy iff every result is healthy (an empty set is healthy), unhealthy
/// iff none is, degraded otherwise.
pub fn aggregate<'a, I>(results: I) -> HealthStatus
where
    I: IntoIterator<Item = &'a HealthCheckResult>,
{
    let mut total = 0usize;
    let mut healthy = 0usize;
    for result in results {
        total += 1;
        if result.is_healthy() {
            healthy += 1;
        }
    }

    if healthy == total {
        HealthStatus::Healthy
    } else if healthy == 0 {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

/// Everything one check cycle produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub overall: HealthStatus,

    /// Results in configuration order
    pub results: Vec<HealthCheckResult>,

    /// Checks that missed the cycle deadline
    pub missing: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    pub completed_at: DateTime<Utc>,
}

/// Percent thresholds for usage style checks (disk, memory).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageThresholds {
    /// At or above this percentage the check is degraded
    pub degraded: f64,
    /// At or above this percentage the check is unhealthy
    pub unhealthy: f64,
}

impl Default for UsageThresholds {
    fn default() -> Self {
        Self {
            degraded: 80.0,
            unhealthy: 90.0,
        }
    }
}

impl UsageThresholds {
    pub fn classify(&self, percent: f64) -> HealthStatus {
        if percent >= self.unhealthy {
            HealthStatus::Unhealthy
        } else if percent >= self.degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
