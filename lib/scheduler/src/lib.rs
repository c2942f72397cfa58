//! Background re-testing of integrations.
//!
//! This crate provides:
//!
//! - **Retest policy**: Fixed interval while healthy, capped exponential backoff while failing
//! - **Health monitor**: One tick loop that re-tests due integrations with bounded concurrency

pub mod error;
pub mod monitor;
pub mod schedule;

pub use error::MonitorError;
pub use monitor::{HealthMonitor, HealthMonitorConfig, MonitorHandle, TickSummary};
pub use schedule::RetestPolicy;
