//! The health monitor loop.
//!
//! A single task wakes on a fixed tick, asks the lifecycle controller for
//! integrations whose `next_test_at` has passed, and re-tests them through the
//! same single-flight path user-triggered tests use. Only `Active` and `Error`
//! integrations are ever due.

use crate::error::MonitorError;
use crate::schedule::RetestPolicy;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use switchyard_core::IntegrationId;
use switchyard_integration::{Actor, LifecycleController, LifecycleError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Health monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthMonitorConfig {
    /// How often the loop looks for due integrations.
    #[serde(
        rename = "tick_seconds",
        default = "default_tick",
        deserialize_with = "switchyard_core::duration::seconds"
    )]
    pub tick: Duration,
    /// Tests running at once within one tick.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Most integrations taken per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(
        rename = "active_interval_seconds",
        default = "default_active_interval",
        deserialize_with = "switchyard_core::duration::seconds"
    )]
    pub active_interval: Duration,
    #[serde(
        rename = "base_backoff_seconds",
        default = "default_base_backoff",
        deserialize_with = "switchyard_core::duration::seconds"
    )]
    pub base_backoff: Duration,
    #[serde(
        rename = "max_backoff_seconds",
        default = "default_max_backoff",
        deserialize_with = "switchyard_core::duration::seconds"
    )]
    pub max_backoff: Duration,
}

fn default_tick() -> Duration {
    Duration::from_secs(30)
}

fn default_concurrency() -> usize {
    4
}

fn default_batch_size() -> usize {
    64
}

fn default_active_interval() -> Duration {
    Duration::from_secs(900)
}

fn default_base_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(3600)
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            active_interval: default_active_interval(),
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl HealthMonitorConfig {
    /// The re-test schedule this config describes.
    #[must_use]
    pub fn policy(&self) -> RetestPolicy {
        RetestPolicy {
            active_interval: self.active_interval,
            base_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
        }
    }

    fn validate(&self) -> Result<(), MonitorError> {
        let invalid = |reason: &str| {
            Err(MonitorError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.tick.is_zero() {
            return invalid("tick must be positive");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch size must be at least 1");
        }
        if self.active_interval.is_zero() || self.base_backoff.is_zero() {
            return invalid("intervals must be positive");
        }
        if self.base_backoff > self.max_backoff {
            return invalid("base backoff exceeds max backoff");
        }
        Ok(())
    }
}

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Integrations found due.
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Integrations that could not be tested (disabled or deleted meanwhile, storage errors).
    pub skipped: usize,
}

enum Checked {
    Succeeded,
    Failed,
    Skipped,
}

/// Periodically re-tests monitored integrations.
pub struct HealthMonitor {
    controller: LifecycleController,
    config: HealthMonitorConfig,
    policy: RetestPolicy,
}

impl HealthMonitor {
    /// Creates a monitor.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when the configuration cannot be run.
    pub fn new(
        controller: LifecycleController,
        config: HealthMonitorConfig,
    ) -> switchyard_core::Result<Self, MonitorError> {
        config.validate()?;
        Ok(Self {
            policy: config.policy(),
            controller,
            config,
        })
    }

    /// Runs the loop on a new task.
    #[must_use]
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(self.run(signal));
        MonitorHandle { shutdown, task }
    }

    /// Ticks until `shutdown` turns true or its sender is dropped.
    ///
    /// A tick in progress when shutdown is signalled runs to completion.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            tick_secs = self.config.tick.as_secs(),
            concurrency = self.config.concurrency,
            "health monitor started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(summary) if summary.due > 0 => info!(
                            due = summary.due,
                            succeeded = summary.succeeded,
                            failed = summary.failed,
                            skipped = summary.skipped,
                            "health check tick finished"
                        ),
                        Ok(_) => debug!("no integrations due"),
                        Err(report) => error!(error = %report, "health check tick failed"),
                    }
                }
            }
        }

        info!("health monitor stopped");
    }

    /// Tests every integration due at `now`, up to the batch size.
    ///
    /// # Errors
    ///
    /// `QueryFailed` when due integrations cannot be listed. Failures of
    /// individual integrations are counted, not returned.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> switchyard_core::Result<TickSummary, MonitorError> {
        let due = self
            .controller
            .due_for_test(now, self.config.batch_size)
            .await
            .map_err(|report| MonitorError::QueryFailed {
                reason: report.current_context().to_string(),
            })?;

        let summary = Mutex::new(TickSummary {
            due: due.len(),
            ..TickSummary::default()
        });
        futures::stream::iter(due)
            .for_each_concurrent(self.config.concurrency, |integration| {
                let summary = &summary;
                async move {
                    let checked = self.check(integration.id, now).await;
                    let mut summary = summary.lock().unwrap_or_else(PoisonError::into_inner);
                    match checked {
                        Checked::Succeeded => summary.succeeded += 1,
                        Checked::Failed => summary.failed += 1,
                        Checked::Skipped => summary.skipped += 1,
                    }
                }
            })
            .await;

        Ok(summary.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    async fn check(&self, id: IntegrationId, now: DateTime<Utc>) -> Checked {
        let report = match self.controller.test_connection(Actor::HealthMonitor, id).await {
            Ok(report) => report,
            Err(err) => {
                match err.current_context() {
                    // Disabled or deleted since the due query ran.
                    LifecycleError::InvalidTransition { .. } | LifecycleError::NotFound { .. } => {
                        debug!(integration_id = %id, error = %err.current_context(), "integration no longer testable");
                    }
                    other => warn!(integration_id = %id, error = %other, "health check could not run"),
                }
                return Checked::Skipped;
            }
        };

        let next = self.policy.next_test_at(&report.integration, now);
        if let Err(err) = self.controller.schedule_next_test(id, next).await {
            warn!(integration_id = %id, error = %err.current_context(), "failed to schedule next health check");
        }

        if report.ok {
            Checked::Succeeded
        } else {
            Checked::Failed
        }
    }
}

/// A running monitor.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signals shutdown and waits for the current tick to finish.
    pub async fn shutdown(self) {
        // A send error means the loop already exited.
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "health monitor task panicked");
        }
    }
}
