//! Serde helpers for durations given as whole seconds in configuration.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Deserializes a `u64` number of seconds into a [`Duration`].
///
/// # Errors
///
/// Fails when the value is not a non-negative integer.
pub fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}
