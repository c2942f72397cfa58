//! Integration lifecycle orchestration.
//!
//! [`LifecycleController`] is the only entry point for changing an
//! integration. It turns secret-store and connector failures into integration
//! state plus an audit entry, so nothing above it sees cipher errors.
//!
//! Operations on one integration are linearized by a per-id lock. Connection
//! tests are additionally single-flight: concurrent requests for the same id
//! share one probe and one resulting transition.

use crate::audit::{Actor, AuditEntry, AuditEvent, AuditLog};
use crate::connector::ConnectorDispatch;
use crate::credential::{CredentialKind, SecretFields, SecretStore};
use crate::error::{ConnectorError, LifecycleError, SecretStoreError};
use crate::registry::{
    Integration, IntegrationKind, IntegrationRegistry, IntegrationState, ListFilter, StateChange,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use switchyard_core::{IntegrationId, OwnerId};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

/// `last_error` recorded when the stored credential cannot be decrypted.
pub const CREDENTIALS_UNREADABLE: &str = "credentials unreadable";

/// Lifecycle controller configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Upper bound on one connection test.
    #[serde(
        rename = "test_timeout_seconds",
        default = "default_test_timeout",
        deserialize_with = "switchyard_core::duration::seconds"
    )]
    pub test_timeout: Duration,
}

fn default_test_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            test_timeout: default_test_timeout(),
        }
    }
}

/// Everything needed to create an integration.
#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub kind: IntegrationKind,
    pub display_name: String,
    pub config: BTreeMap<String, String>,
    pub credential_kind: CredentialKind,
    pub secret: SecretFields,
    /// Run a connection test right after creating.
    pub test_now: bool,
}

/// Result of one connection test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestReport {
    /// The integration after the resulting transition.
    pub integration: Integration,
    pub ok: bool,
    /// Failure reason, redacted.
    pub reason: Option<String>,
    /// Connector detail, redacted.
    pub detail: Map<String, Value>,
}

type SharedTest = Shared<BoxFuture<'static, Result<TestReport, LifecycleError>>>;

/// Per-integration async locks.
#[derive(Default)]
struct IdLocks(std::sync::Mutex<HashMap<IntegrationId, Arc<Mutex<()>>>>);

impl IdLocks {
    async fn acquire(&self, id: IntegrationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody holds or waits on are only referenced by the map.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Orchestrates create, update, test, disable and delete.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

struct Inner {
    registry: IntegrationRegistry,
    dispatch: Arc<ConnectorDispatch>,
    config: LifecycleConfig,
    locks: IdLocks,
    in_flight: Mutex<HashMap<IntegrationId, SharedTest>>,
}

impl LifecycleController {
    /// Creates a controller.
    #[must_use]
    pub fn new(
        registry: IntegrationRegistry,
        dispatch: Arc<ConnectorDispatch>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                dispatch,
                config,
                locks: IdLocks::default(),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The connector table this controller dispatches through.
    #[must_use]
    pub fn dispatch(&self) -> &Arc<ConnectorDispatch> {
        &self.inner.dispatch
    }

    /// Creates a `Pending` integration and stores its credential.
    ///
    /// The connection is only tested when `request.test_now` is set.
    ///
    /// # Errors
    ///
    /// Configuration errors (`UnsupportedKind`, `DuplicateName`,
    /// `InvalidName`, `InvalidConfig`, `InvalidCredential`) or fatal ones
    /// (`StorageFailed`, `AuditFailed`). Nothing is left behind on failure.
    #[instrument(skip(self, request), fields(owner = %owner, kind = %request.kind))]
    pub async fn create_integration(
        &self,
        owner: OwnerId,
        request: NewIntegration,
    ) -> switchyard_core::Result<Integration, LifecycleError> {
        let integration = self.inner.create(owner, &request).await?;
        if request.test_now {
            let report = self
                .test_connection(Actor::Owner(owner), integration.id)
                .await?;
            return Ok(report.integration);
        }
        Ok(integration)
    }

    /// Runs a live connection test and records the outcome.
    ///
    /// A failed probe is not an error: it is returned as a report with
    /// `ok == false` after moving the integration to `Error`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `UnsupportedKind`, `InvalidTransition` for a disabled
    /// integration, or a fatal error.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn test_connection(
        &self,
        actor: Actor,
        id: IntegrationId,
    ) -> switchyard_core::Result<TestReport, LifecycleError> {
        self.inner.visible(actor, id).await?;
        let test = Inner::join_or_start_test(&self.inner, actor, id).await;
        Ok(test.await?)
    }

    /// Replaces the credential and resets the integration to `Pending`.
    ///
    /// A disabled integration stays disabled.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidCredential` or a fatal error.
    #[instrument(skip(self, secret), fields(actor = %actor, credential_kind = %credential_kind))]
    pub async fn update_credential(
        &self,
        actor: Actor,
        id: IntegrationId,
        credential_kind: CredentialKind,
        secret: SecretFields,
    ) -> switchyard_core::Result<Integration, LifecycleError> {
        Ok(self
            .inner
            .update_credential(actor, id, credential_kind, &secret)
            .await?)
    }

    /// Replaces the config map. State is untouched.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidConfig` or a fatal error.
    #[instrument(skip(self, config), fields(actor = %actor))]
    pub async fn update_config(
        &self,
        actor: Actor,
        id: IntegrationId,
        config: BTreeMap<String, String>,
    ) -> switchyard_core::Result<Integration, LifecycleError> {
        Ok(self.inner.update_config(actor, id, config).await?)
    }

    /// Changes the display name. State is untouched.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidName`, `DuplicateName` or a fatal error.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn rename(
        &self,
        actor: Actor,
        id: IntegrationId,
        display_name: &str,
    ) -> switchyard_core::Result<Integration, LifecycleError> {
        Ok(self.inner.rename(actor, id, display_name).await?)
    }

    /// Switches an `Active` or `Error` integration off.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidTransition` or a fatal error.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn disable(
        &self,
        actor: Actor,
        id: IntegrationId,
        reason: Option<String>,
    ) -> switchyard_core::Result<Integration, LifecycleError> {
        Ok(self.inner.disable(actor, id, reason).await?)
    }

    /// Moves a disabled integration back to `Pending`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidTransition` when not disabled, or a fatal error.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn reenable(
        &self,
        actor: Actor,
        id: IntegrationId,
    ) -> switchyard_core::Result<Integration, LifecycleError> {
        Ok(self.inner.reenable(actor, id).await?)
    }

    /// Deletes an integration and its credential. Idempotent.
    ///
    /// # Errors
    ///
    /// A fatal error only.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn delete(&self, actor: Actor, id: IntegrationId) -> switchyard_core::Result<(), LifecycleError> {
        Ok(self.inner.delete(actor, id).await?)
    }

    /// Loads an integration visible to `actor`.
    ///
    /// # Errors
    ///
    /// `NotFound` or a fatal error.
    pub async fn get(
        &self,
        actor: Actor,
        id: IntegrationId,
    ) -> switchyard_core::Result<Integration, LifecycleError> {
        Ok(self.inner.visible(actor, id).await?)
    }

    /// Lists an owner's integrations, ordered by display name.
    ///
    /// # Errors
    ///
    /// A fatal error only.
    pub async fn list(
        &self,
        owner: OwnerId,
        filter: &ListFilter,
    ) -> switchyard_core::Result<Vec<Integration>, LifecycleError> {
        Ok(self
            .inner
            .registry
            .list(owner, filter)
            .await
            .map_err(LifecycleError::from)?)
    }

    /// Lists an integration's audit entries, oldest first.
    ///
    /// # Errors
    ///
    /// `NotFound` or a fatal error.
    pub async fn audit_trail(
        &self,
        actor: Actor,
        id: IntegrationId,
    ) -> switchyard_core::Result<Vec<AuditEntry>, LifecycleError> {
        self.inner.visible(actor, id).await?;
        Ok(self
            .inner
            .audit()
            .list_for(id)
            .await
            .map_err(LifecycleError::from)?)
    }

    /// Lists integrations due for an unattended test.
    ///
    /// # Errors
    ///
    /// A fatal error only.
    pub async fn due_for_test(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> switchyard_core::Result<Vec<Integration>, LifecycleError> {
        Ok(self
            .inner
            .registry
            .due_for_test(now, limit)
            .await
            .map_err(LifecycleError::from)?)
    }

    /// Sets when the health monitor should next test an integration.
    ///
    /// # Errors
    ///
    /// `NotFound` or a fatal error.
    pub async fn schedule_next_test(
        &self,
        id: IntegrationId,
        at: Option<DateTime<Utc>>,
    ) -> switchyard_core::Result<(), LifecycleError> {
        let _guard = self.inner.locks.acquire(id).await;
        Ok(self
            .inner
            .registry
            .set_next_test_at(id, at)
            .await
            .map_err(LifecycleError::from)?)
    }
}

impl Inner {
    fn secrets(&self) -> &SecretStore {
        self.registry.secrets()
    }

    fn audit(&self) -> &Arc<dyn AuditLog> {
        self.registry.audit()
    }

    async fn record(&self, entry: AuditEntry) -> Result<(), LifecycleError> {
        Ok(self.audit().append(entry).await?)
    }

    /// Loads an integration, hiding other owners' records.
    async fn visible(&self, actor: Actor, id: IntegrationId) -> Result<Integration, LifecycleError> {
        let integration = self.registry.get(id).await?;
        if actor.can_see(integration.owner) {
            Ok(integration)
        } else {
            Err(LifecycleError::NotFound { id })
        }
    }

    fn check_credential(
        &self,
        kind: IntegrationKind,
        credential_kind: CredentialKind,
        secret: &SecretFields,
    ) -> Result<(), LifecycleError> {
        let connector = self.dispatch.resolve(kind)?;
        if !connector.info().accepts(credential_kind) {
            return Err(LifecycleError::InvalidCredential {
                reason: format!("{kind} does not accept {credential_kind} credentials"),
            });
        }
        credential_kind
            .validate(secret)
            .map_err(|reason| LifecycleError::InvalidCredential { reason })
    }

    async fn create(
        &self,
        owner: OwnerId,
        request: &NewIntegration,
    ) -> Result<Integration, LifecycleError> {
        self.check_credential(request.kind, request.credential_kind, &request.secret)?;

        let integration = self
            .registry
            .create(
                owner,
                request.kind,
                &request.display_name,
                request.config.clone(),
            )
            .await?;
        let id = integration.id;
        let _guard = self.locks.acquire(id).await;

        if let Err(e) = self
            .secrets()
            .put(id, request.credential_kind, &request.secret)
            .await
        {
            self.roll_back_create(id).await;
            return Err(LifecycleError::StorageFailed {
                details: e.to_string(),
            });
        }

        let entry = AuditEntry::new(id, AuditEvent::Created, Actor::Owner(owner))
            .with_detail("kind", request.kind.as_str())
            .with_detail("display_name", integration.display_name.clone())
            .with_detail("credential_kind", request.credential_kind.as_str());
        if let Err(e) = self.record(entry).await {
            self.roll_back_create(id).await;
            return Err(e);
        }

        info!(integration_id = %id, "integration created");
        Ok(integration)
    }

    async fn roll_back_create(&self, id: IntegrationId) {
        if let Err(e) = self.registry.discard(id).await {
            warn!(integration_id = %id, error = %e, "failed to roll back partial create");
        }
    }

    async fn join_or_start_test(this: &Arc<Self>, actor: Actor, id: IntegrationId) -> SharedTest {
        let mut in_flight = this.in_flight.lock().await;
        if let Some(test) = in_flight.get(&id) {
            debug!(integration_id = %id, "joining in-flight connection test");
            return test.clone();
        }

        // The probe runs in its own task so that a caller dropping its
        // request does not cancel the test for everyone else.
        let runner = Arc::clone(this);
        let task = tokio::spawn(async move {
            let result = runner.run_test(actor, id).await;
            runner.in_flight.lock().await.remove(&id);
            result
        });

        let cleanup = Arc::clone(this);
        let test = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(integration_id = %id, error = %e, "connection test task aborted");
                    cleanup.in_flight.lock().await.remove(&id);
                    Err(LifecycleError::TestAborted { id })
                }
            }
        }
        .boxed()
        .shared();

        in_flight.insert(id, test.clone());
        test
    }

    async fn run_test(&self, actor: Actor, id: IntegrationId) -> Result<TestReport, LifecycleError> {
        let _guard = self.locks.acquire(id).await;
        let integration = self.registry.get(id).await?;
        if integration.state == IntegrationState::Disabled {
            return Err(LifecycleError::InvalidTransition {
                id,
                from: IntegrationState::Disabled,
                to: IntegrationState::Active,
            });
        }
        let connector = self.dispatch.resolve(integration.kind)?;

        let secret = match self.secrets().get(id).await {
            Ok(secret) => secret,
            Err(SecretStoreError::CredentialUnavailable { cause, .. }) => {
                warn!(integration_id = %id, cause = %cause, "credential unreadable, skipping probe");
                // The cipher cause names key versions; only the audit log sees it.
                let mut internal = Map::new();
                internal.insert("cause".to_string(), Value::String(cause.to_string()));
                return self
                    .record_failure(
                        actor,
                        id,
                        CREDENTIALS_UNREADABLE.to_string(),
                        Map::new(),
                        internal,
                    )
                    .await;
            }
            Err(e) => {
                return Err(LifecycleError::StorageFailed {
                    details: e.to_string(),
                });
            }
        };

        let timeout = self.config.test_timeout;
        let probe = tokio::time::timeout(
            timeout,
            connector.test_connection(&integration.config, &secret, timeout),
        )
        .await
        .unwrap_or(Err(ConnectorError::Timeout));

        match probe {
            Ok(outcome) => {
                let detail = match secret.fields.redact_json(Value::Object(outcome.detail.clone())) {
                    Value::Object(detail) => detail,
                    _ => Map::new(),
                };
                if outcome.ok {
                    self.record_success(actor, id, detail).await
                } else {
                    let reason = outcome.reason().map_or_else(
                        || "connection test failed".to_string(),
                        |reason| secret.fields.redact(reason),
                    );
                    self.record_failure(actor, id, reason, detail, Map::new())
                        .await
                }
            }
            Err(e) => {
                let reason = secret.fields.redact(&e.to_string());
                self.record_failure(actor, id, reason, Map::new(), Map::new())
                    .await
            }
        }
    }

    async fn record_success(
        &self,
        actor: Actor,
        id: IntegrationId,
        detail: Map<String, Value>,
    ) -> Result<TestReport, LifecycleError> {
        let integration = self
            .registry
            .set_state(
                id,
                StateChange::to(IntegrationState::Active).tested_at(Utc::now()),
            )
            .await?;
        self.record(
            AuditEntry::new(id, AuditEvent::TestSucceeded, actor).with_details(detail.clone()),
        )
        .await?;

        info!(integration_id = %id, "connection test succeeded");
        Ok(TestReport {
            integration,
            ok: true,
            reason: None,
            detail,
        })
    }

    /// Moves the integration to `Error`. `internal` goes to the audit entry
    /// only, never to the returned report.
    async fn record_failure(
        &self,
        actor: Actor,
        id: IntegrationId,
        reason: String,
        detail: Map<String, Value>,
        internal: Map<String, Value>,
    ) -> Result<TestReport, LifecycleError> {
        let integration = self
            .registry
            .set_state(
                id,
                StateChange::to(IntegrationState::Error)
                    .with_reason(reason.clone())
                    .tested_at(Utc::now()),
            )
            .await?;
        self.record(
            AuditEntry::new(id, AuditEvent::TestFailed, actor)
                .with_details(detail.clone())
                .with_details(internal)
                .with_detail("reason", reason.clone()),
        )
        .await?;

        warn!(
            integration_id = %id,
            reason = %reason,
            consecutive_failures = integration.consecutive_failures,
            "connection test failed"
        );
        Ok(TestReport {
            integration,
            ok: false,
            reason: Some(reason),
            detail,
        })
    }

    async fn update_credential(
        &self,
        actor: Actor,
        id: IntegrationId,
        credential_kind: CredentialKind,
        secret: &SecretFields,
    ) -> Result<Integration, LifecycleError> {
        let _guard = self.locks.acquire(id).await;
        let integration = self.visible(actor, id).await?;
        self.check_credential(integration.kind, credential_kind, secret)?;

        // A failed write leaves both the old secret and the old state standing.
        self.secrets()
            .put(id, credential_kind, secret)
            .await
            .map_err(|e| LifecycleError::StorageFailed {
                details: e.to_string(),
            })?;

        let integration = if integration.state == IntegrationState::Disabled {
            integration
        } else {
            self.registry
                .set_state(id, StateChange::to(IntegrationState::Pending))
                .await?
        };
        self.record(
            AuditEntry::new(id, AuditEvent::CredentialUpdated, actor)
                .with_detail("credential_kind", credential_kind.as_str()),
        )
        .await?;

        info!(integration_id = %id, state = %integration.state, "credential updated");
        Ok(integration)
    }

    async fn update_config(
        &self,
        actor: Actor,
        id: IntegrationId,
        config: BTreeMap<String, String>,
    ) -> Result<Integration, LifecycleError> {
        let _guard = self.locks.acquire(id).await;
        self.visible(actor, id).await?;
        let keys: Vec<Value> = config.keys().cloned().map(Value::String).collect();
        let integration = self.registry.update_config(id, config).await?;
        self.record(
            AuditEntry::new(id, AuditEvent::ConfigUpdated, actor).with_detail("keys", keys),
        )
        .await?;
        Ok(integration)
    }

    async fn rename(
        &self,
        actor: Actor,
        id: IntegrationId,
        display_name: &str,
    ) -> Result<Integration, LifecycleError> {
        let _guard = self.locks.acquire(id).await;
        let before = self.visible(actor, id).await?;
        let integration = self.registry.rename(id, display_name).await?;
        self.record(
            AuditEntry::new(id, AuditEvent::Renamed, actor)
                .with_detail("from", before.display_name)
                .with_detail("to", integration.display_name.clone()),
        )
        .await?;
        Ok(integration)
    }

    async fn disable(
        &self,
        actor: Actor,
        id: IntegrationId,
        reason: Option<String>,
    ) -> Result<Integration, LifecycleError> {
        let _guard = self.locks.acquire(id).await;
        self.visible(actor, id).await?;
        let integration = self
            .registry
            .set_state(id, StateChange::to(IntegrationState::Disabled))
            .await?;

        let mut entry = AuditEntry::new(id, AuditEvent::Disabled, actor);
        if let Some(reason) = reason {
            entry = entry.with_detail("reason", reason);
        }
        self.record(entry).await?;

        info!(integration_id = %id, "integration disabled");
        Ok(integration)
    }

    async fn reenable(&self, actor: Actor, id: IntegrationId) -> Result<Integration, LifecycleError> {
        let _guard = self.locks.acquire(id).await;
        let current = self.visible(actor, id).await?;
        if current.state != IntegrationState::Disabled {
            return Err(LifecycleError::InvalidTransition {
                id,
                from: current.state,
                to: IntegrationState::Pending,
            });
        }
        let integration = self
            .registry
            .set_state(id, StateChange::to(IntegrationState::Pending))
            .await?;
        self.record(AuditEntry::new(id, AuditEvent::Reenabled, actor))
            .await?;

        info!(integration_id = %id, "integration re-enabled");
        Ok(integration)
    }

    async fn delete(&self, actor: Actor, id: IntegrationId) -> Result<(), LifecycleError> {
        let _guard = self.locks.acquire(id).await;
        match self.visible(actor, id).await {
            Ok(_) => {}
            Err(LifecycleError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.registry.delete(id, actor).await?;
        Ok(())
    }
}
