//! When an integration should next be re-tested.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;
use switchyard_integration::{Integration, IntegrationState};

/// Doubling stops here; `2^20` times any sane base is already past the cap.
const MAX_BACKOFF_DOUBLINGS: u32 = 20;

/// Re-test schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetestPolicy {
    /// Interval between tests while `Active`.
    pub active_interval: Duration,
    /// Delay after the first consecutive failure.
    pub base_backoff: Duration,
    /// Upper bound on the failure delay.
    pub max_backoff: Duration,
}

impl RetestPolicy {
    /// Delay before the next test after `consecutive_failures` failures in a row.
    #[must_use]
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let doublings = consecutive_failures
            .saturating_sub(1)
            .min(MAX_BACKOFF_DOUBLINGS);
        self.base_backoff
            .saturating_mul(1 << doublings)
            .min(self.max_backoff)
    }

    /// Next test time for `integration`, or `None` if it is not monitored.
    #[must_use]
    pub fn next_test_at(&self, integration: &Integration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delay = match integration.state {
            IntegrationState::Active => self.active_interval,
            IntegrationState::Error => self.backoff(integration.consecutive_failures),
            IntegrationState::Pending | IntegrationState::Disabled => return None,
        };
        let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use switchyard_core::{IntegrationId, OwnerId};
    use switchyard_integration::IntegrationKind;

    fn policy() -> RetestPolicy {
        RetestPolicy {
            active_interval: Duration::from_secs(900),
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(3600),
        }
    }

    fn integration(state: IntegrationState, consecutive_failures: u32) -> Integration {
        let now = Utc::now();
        Integration {
            id: IntegrationId::new(),
            owner: OwnerId::new(),
            kind: IntegrationKind::GenericHttp,
            display_name: "probe".to_string(),
            config: BTreeMap::new(),
            state,
            last_error: None,
            last_tested_at: None,
            next_test_at: None,
            consecutive_failures,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_secs(60));
        assert_eq!(p.backoff(1), Duration::from_secs(60));
        assert_eq!(p.backoff(2), Duration::from_secs(120));
        assert_eq!(p.backoff(4), Duration::from_secs(480));
        assert_eq!(p.backoff(7), Duration::from_secs(3600));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn next_test_by_state() {
        let p = policy();
        let now = Utc::now();

        assert_eq!(
            p.next_test_at(&integration(IntegrationState::Active, 0), now),
            Some(now + TimeDelta::seconds(900))
        );
        assert_eq!(
            p.next_test_at(&integration(IntegrationState::Error, 3), now),
            Some(now + TimeDelta::seconds(240))
        );
        assert_eq!(p.next_test_at(&integration(IntegrationState::Pending, 0), now), None);
        assert_eq!(p.next_test_at(&integration(IntegrationState::Disabled, 5), now), None);
    }

    #[test]
    fn huge_interval_saturates() {
        let p = RetestPolicy {
            active_interval: Duration::MAX,
            ..policy()
        };
        let at = p.next_test_at(&integration(IntegrationState::Active, 0), Utc::now());
        assert_eq!(at, Some(DateTime::<Utc>::MAX_UTC));
    }
}
