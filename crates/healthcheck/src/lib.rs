//! Dependency health checking for the edge platform manager.
//!
//! This crate provides the probe contract and the pieces needed to run a
//! health check cycle:
//! - [`HealthCheck`]: one probe, run once per cycle
//! - [`DependencyCheck`]: connect/exercise probes for stores, caches and RPC pools
//! - [`UsageCheck`]: disk and memory usage against percent thresholds
//! - [`EndpointCheck`]: HTTP GET endpoint checks
//! - [`run_cycle`]: concurrent fan-out with per-check timeouts and a cycle deadline
//!
//! # Example
//!
//! ```no_run
//! use healthcheck::{CycleTiming, HealthCheck, UsageCheck, UsageThresholds, run_cycle};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let checks: Vec<Arc<dyn HealthCheck>> = vec![
//!     Arc::new(UsageCheck::memory("memory", UsageThresholds::default())),
//!     Arc::new(UsageCheck::disk("disk", "/", UsageThresholds::default())),
//! ];
//!
//! let report = run_cycle(&checks, CycleTiming::default()).await;
//! println!("overall: {}", report.overall);
//! # }
//! ```

pub mod checkers;
pub mod runner;
pub mod types;

pub use checkers::{DependencyCheck, DependencyProbe, EndpointCheck, HealthCheck, UsageCheck};
pub use runner::{CycleTiming, run_cycle};
pub use types::{CycleReport, HealthCheckResult, HealthStatus, UsageThresholds, aggregate};
