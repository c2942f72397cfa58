//! Integration records and the lifecycle state machine.
//!
//! The registry is the only writer of integration state. Every state write
//! goes through [`IntegrationRegistry::set_state`], which enforces the
//! transition table and hands the store a compare-and-set on the state it
//! read.

use crate::audit::{Actor, AuditEntry, AuditEvent, AuditLog};
use crate::credential::SecretStore;
use crate::error::{DispatchError, RegistryError, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use switchyard_core::{IntegrationId, OwnerId};
use tracing::{debug, info};

/// Longest accepted display name, in characters.
pub const MAX_DISPLAY_NAME_LEN: usize = 255;

/// Config keys that name secrets; secrets belong in the credential.
const SECRET_CONFIG_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "api_key",
    "apikey",
    "private_key",
    "access_token",
    "auth_token",
    "client_secret",
];

/// The kind of external system an integration connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrationKind {
    /// A GitOps deployment controller.
    DeploymentController,
    /// A source-control host.
    SourceHost,
    /// A team chat platform.
    ChatPlatform,
    /// Any HTTP endpoint.
    GenericHttp,
}

impl IntegrationKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::DeploymentController,
        Self::SourceHost,
        Self::ChatPlatform,
        Self::GenericHttp,
    ];

    /// Returns the persisted name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeploymentController => "deployment-controller",
            Self::SourceHost => "source-host",
            Self::ChatPlatform => "chat-platform",
            Self::GenericHttp => "generic-http",
        }
    }
}

impl fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DispatchError::UnsupportedKind {
                kind: s.to_string(),
            })
    }
}

/// Lifecycle state of an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationState {
    /// Created or re-credentialed, not yet verified.
    Pending,
    /// Last test succeeded.
    Active,
    /// Last test failed or the credential is unreadable.
    Error,
    /// Switched off by the owner.
    Disabled,
}

impl IntegrationState {
    /// Every state.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Active, Self::Error, Self::Disabled];

    /// Returns the persisted name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }

    /// Returns true if the transition table allows `self -> to`.
    ///
    /// `Active` is only reachable from a test outcome (`Pending`, `Active`
    /// or `Error`), never from `Disabled`. `Pending` is reachable from every
    /// state: re-enable leaves `Disabled` that way and a credential change
    /// resets the others.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use IntegrationState::{Active, Disabled, Error, Pending};
        matches!(
            (self, to),
            (Pending | Active | Error, Active | Error)
                | (Active | Error, Disabled)
                | (_, Pending)
        )
    }

    /// Returns true if the health monitor re-tests integrations in this state.
    #[must_use]
    pub fn is_monitored(self) -> bool {
        matches!(self, Self::Active | Self::Error)
    }
}

impl fmt::Display for IntegrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown integration state '{s}'"))
    }
}

/// One configured connection to an external system.
///
/// Holds no secret material; the credential lives in the secret store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub id: IntegrationId,
    pub owner: OwnerId,
    pub kind: IntegrationKind,
    pub display_name: String,
    pub config: BTreeMap<String, String>,
    pub state: IntegrationState,
    pub last_error: Option<String>,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub next_test_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    fn new(
        owner: OwnerId,
        kind: IntegrationKind,
        display_name: String,
        config: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: IntegrationId::new(),
            owner,
            kind,
            display_name,
            config,
            state: IntegrationState::Pending,
            last_error: None,
            last_tested_at: None,
            next_test_at: None,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A requested state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub to: IntegrationState,
    /// Failure reason; becomes `last_error` when moving to `Error`.
    pub reason: Option<String>,
    /// When the test that caused this change finished.
    pub tested_at: Option<DateTime<Utc>>,
}

impl StateChange {
    /// A change to `state` with no reason or test stamp.
    #[must_use]
    pub fn to(state: IntegrationState) -> Self {
        Self {
            to: state,
            reason: None,
            tested_at: None,
        }
    }

    /// Sets the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Stamps the test completion time.
    #[must_use]
    pub fn tested_at(mut self, at: DateTime<Utc>) -> Self {
        self.tested_at = Some(at);
        self
    }
}

/// The full set of columns written by one state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateWrite {
    /// The state the write was computed from; the write only applies if the
    /// stored state still equals it.
    pub expected: IntegrationState,
    pub state: IntegrationState,
    pub last_error: Option<String>,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub next_test_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub updated_at: DateTime<Utc>,
}

impl StateWrite {
    fn compute(current: &Integration, change: &StateChange) -> Self {
        let (last_error, consecutive_failures) = match change.to {
            IntegrationState::Active | IntegrationState::Pending => (None, 0),
            IntegrationState::Error => (
                change
                    .reason
                    .clone()
                    .or_else(|| Some("connection test failed".to_string())),
                if current.state == IntegrationState::Error {
                    current.consecutive_failures.saturating_add(1)
                } else {
                    1
                },
            ),
            IntegrationState::Disabled => {
                (current.last_error.clone(), current.consecutive_failures)
            }
        };

        let next_test_at = if change.to.is_monitored() {
            current.next_test_at
        } else {
            None
        };

        Self {
            expected: current.state,
            state: change.to,
            last_error,
            last_tested_at: change.tested_at.or(current.last_tested_at),
            next_test_at,
            consecutive_failures,
            updated_at: Utc::now(),
        }
    }

    fn apply(&self, integration: &mut Integration) {
        integration.state = self.state;
        integration.last_error.clone_from(&self.last_error);
        integration.last_tested_at = self.last_tested_at;
        integration.next_test_at = self.next_test_at;
        integration.consecutive_failures = self.consecutive_failures;
        integration.updated_at = self.updated_at;
    }
}

/// Optional filters for listing integrations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ListFilter {
    pub state: Option<IntegrationState>,
    pub kind: Option<IntegrationKind>,
}

impl ListFilter {
    /// Returns true if `integration` passes the filter.
    #[must_use]
    pub fn matches(&self, integration: &Integration) -> bool {
        self.state.is_none_or(|s| s == integration.state)
            && self.kind.is_none_or(|k| k == integration.kind)
    }
}

/// Persistence for integration records.
///
/// Implementations serialize writes per id and must reject a second record
/// with the same display name in one owner scope.
#[async_trait]
pub trait IntegrationStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// `DuplicateName` when the owner already has an integration with this name.
    async fn insert(&self, integration: &Integration) -> Result<(), StoreError>;

    /// Loads a record by id.
    async fn find(&self, id: IntegrationId) -> Result<Option<Integration>, StoreError>;

    /// Lists an owner's records matching `filter`, ordered by display name.
    async fn list(
        &self,
        owner: OwnerId,
        filter: &ListFilter,
    ) -> Result<Vec<Integration>, StoreError>;

    /// Lists `Active` or `Error` records whose next test is unset or due by
    /// `now`, earliest first, across all owners.
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Integration>, StoreError>;

    /// Replaces the config map. Returns false if the record does not exist.
    async fn update_config(
        &self,
        id: IntegrationId,
        config: &BTreeMap<String, String>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Changes the display name. Returns false if the record does not exist.
    async fn rename(
        &self,
        id: IntegrationId,
        display_name: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Applies a state write if the stored state equals `write.expected`.
    /// Returns false if the record is missing or its state moved.
    async fn write_state(&self, id: IntegrationId, write: &StateWrite) -> Result<bool, StoreError>;

    /// Sets the next scheduled test. Returns false if the record does not exist.
    async fn set_next_test_at(
        &self,
        id: IntegrationId,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Removes a record. Returns true if it existed.
    async fn delete(&self, id: IntegrationId) -> Result<bool, StoreError>;
}

/// Trims and checks a display name.
///
/// # Errors
///
/// `InvalidName` when the trimmed name is empty or too long.
pub fn normalize_display_name(name: &str) -> Result<String, RegistryError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::InvalidName {
            reason: "display name must not be empty".to_string(),
        });
    }
    if trimmed.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(RegistryError::InvalidName {
            reason: format!("display name exceeds {MAX_DISPLAY_NAME_LEN} characters"),
        });
    }
    Ok(trimmed.to_string())
}

/// Checks that a config map holds no empty or secret-looking keys.
///
/// # Errors
///
/// `InvalidConfig` naming the offending key. Values are never echoed.
pub fn validate_config(config: &BTreeMap<String, String>) -> Result<(), RegistryError> {
    for key in config.keys() {
        if key.trim().is_empty() {
            return Err(RegistryError::InvalidConfig {
                reason: "config keys must not be empty".to_string(),
            });
        }
        let normalized = key.trim().to_ascii_lowercase().replace('-', "_");
        if SECRET_CONFIG_KEYS.contains(&normalized.as_str()) {
            return Err(RegistryError::InvalidConfig {
                reason: format!("'{key}' looks like a secret; supply it as a credential field"),
            });
        }
    }
    Ok(())
}

/// Owns integration records and the state machine.
#[derive(Clone)]
pub struct IntegrationRegistry {
    store: Arc<dyn IntegrationStore>,
    secrets: SecretStore,
    audit: Arc<dyn AuditLog>,
}

impl IntegrationRegistry {
    /// Creates a registry over the given stores.
    #[must_use]
    pub fn new(
        store: Arc<dyn IntegrationStore>,
        secrets: SecretStore,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            store,
            secrets,
            audit,
        }
    }

    /// The secret store credentials cascade to.
    #[must_use]
    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    /// The audit log deletions are recorded in.
    #[must_use]
    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    /// Creates a `Pending` integration.
    ///
    /// # Errors
    ///
    /// `InvalidName`, `InvalidConfig`, `DuplicateName` or `StorageFailed`.
    pub async fn create(
        &self,
        owner: OwnerId,
        kind: IntegrationKind,
        display_name: &str,
        config: BTreeMap<String, String>,
    ) -> Result<Integration, RegistryError> {
        let display_name = normalize_display_name(display_name)?;
        validate_config(&config)?;

        let integration = Integration::new(owner, kind, display_name, config);
        self.store.insert(&integration).await?;

        debug!(integration_id = %integration.id, kind = %kind, "integration record created");
        Ok(integration)
    }

    /// Loads an integration.
    ///
    /// # Errors
    ///
    /// `NotFound` or `StorageFailed`.
    pub async fn get(&self, id: IntegrationId) -> Result<Integration, RegistryError> {
        self.store
            .find(id)
            .await?
            .ok_or(RegistryError::NotFound { id })
    }

    /// Lists an owner's integrations.
    ///
    /// # Errors
    ///
    /// `StorageFailed`.
    pub async fn list(
        &self,
        owner: OwnerId,
        filter: &ListFilter,
    ) -> Result<Vec<Integration>, RegistryError> {
        Ok(self.store.list(owner, filter).await?)
    }

    /// Lists integrations the health monitor should test now.
    ///
    /// # Errors
    ///
    /// `StorageFailed`.
    pub async fn due_for_test(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Integration>, RegistryError> {
        Ok(self.store.list_due(now, limit).await?)
    }

    /// Replaces the config map. State is untouched.
    ///
    /// # Errors
    ///
    /// `InvalidConfig`, `NotFound` or `StorageFailed`.
    pub async fn update_config(
        &self,
        id: IntegrationId,
        config: BTreeMap<String, String>,
    ) -> Result<Integration, RegistryError> {
        validate_config(&config)?;
        if !self.store.update_config(id, &config, Utc::now()).await? {
            return Err(RegistryError::NotFound { id });
        }
        self.get(id).await
    }

    /// Changes the display name. State is untouched.
    ///
    /// # Errors
    ///
    /// `InvalidName`, `DuplicateName`, `NotFound` or `StorageFailed`.
    pub async fn rename(
        &self,
        id: IntegrationId,
        display_name: &str,
    ) -> Result<Integration, RegistryError> {
        let display_name = normalize_display_name(display_name)?;
        if !self.store.rename(id, &display_name, Utc::now()).await? {
            return Err(RegistryError::NotFound { id });
        }
        self.get(id).await
    }

    /// Moves an integration to a new state.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` when the table forbids it (state is left
    /// unchanged), `NotFound` or `StorageFailed`.
    pub async fn set_state(
        &self,
        id: IntegrationId,
        change: StateChange,
    ) -> Result<Integration, RegistryError> {
        let mut integration = self.get(id).await?;
        let from = integration.state;
        if !from.can_transition_to(change.to) {
            return Err(RegistryError::InvalidTransition {
                id,
                from,
                to: change.to,
            });
        }

        let write = StateWrite::compute(&integration, &change);
        if !self.store.write_state(id, &write).await? {
            // Lost the compare-and-set: report against whatever is stored now.
            let current = self.get(id).await?;
            return Err(RegistryError::InvalidTransition {
                id,
                from: current.state,
                to: change.to,
            });
        }

        write.apply(&mut integration);
        if from != change.to {
            info!(integration_id = %id, from = %from, to = %change.to, "integration state changed");
        }
        Ok(integration)
    }

    /// Schedules the next health test.
    ///
    /// # Errors
    ///
    /// `NotFound` or `StorageFailed`.
    pub async fn set_next_test_at(
        &self,
        id: IntegrationId,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), RegistryError> {
        if self.store.set_next_test_at(id, at).await? {
            Ok(())
        } else {
            Err(RegistryError::NotFound { id })
        }
    }

    /// Deletes an integration and its credential.
    ///
    /// Idempotent: deleting a missing integration succeeds and records
    /// nothing. Returns true if a record was removed.
    ///
    /// # Errors
    ///
    /// `CredentialCascade`, `StorageFailed` or `AuditFailed`.
    pub async fn delete(&self, id: IntegrationId, actor: Actor) -> Result<bool, RegistryError> {
        let existing = self.store.find(id).await?;

        // Credential first, so a failure never leaves ciphertext without a record.
        self.secrets
            .delete(id)
            .await
            .map_err(|e| RegistryError::CredentialCascade {
                details: e.to_string(),
            })?;
        let removed = self.store.delete(id).await?;

        if let Some(integration) = existing.filter(|_| removed) {
            let entry = AuditEntry::new(id, AuditEvent::Deleted, actor)
                .with_detail("display_name", integration.display_name)
                .with_detail("kind", integration.kind.as_str());
            self.audit
                .append(entry)
                .await
                .map_err(|e| RegistryError::AuditFailed {
                    details: e.to_string(),
                })?;
            info!(integration_id = %id, "integration deleted");
        }

        Ok(removed)
    }

    /// Removes a record and its credential without auditing. Undoes a create
    /// that could not complete.
    pub(crate) async fn discard(&self, id: IntegrationId) -> Result<(), RegistryError> {
        self.secrets
            .delete(id)
            .await
            .map_err(|e| RegistryError::CredentialCascade {
                details: e.to_string(),
            })?;
        self.store.delete(id).await?;
        Ok(())
    }
}
