//! Common utilities and types shared across the edge platform components.

pub mod error;
pub mod logging;
pub mod retry;

pub use error::{Component, Error, ErrorKind, Result, Severity};
pub use retry::RetryPolicy;
