//! Error types for the scheduler crate.

use std::fmt;

/// Errors from the health monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// The monitor configuration cannot be run.
    InvalidConfig { reason: String },
    /// Due integrations could not be listed.
    QueryFailed { reason: String },
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { reason } => write!(f, "invalid health monitor config: {reason}"),
            Self::QueryFailed { reason } => {
                write!(f, "failed to list integrations due for testing: {reason}")
            }
        }
    }
}

impl std::error::Error for MonitorError {}
