//! Append-only audit trail of integration lifecycle events.

use crate::error::AuditError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use switchyard_core::{AuditEntryId, IntegrationId, OwnerId};

/// Who performed an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Actor {
    /// A user acting within their own owner scope.
    Owner(OwnerId),
    /// The background health monitor; not bound to any scope.
    HealthMonitor,
}

const HEALTH_MONITOR: &str = "health-monitor";

impl Actor {
    /// Returns true if this actor may see integrations of `owner`.
    #[must_use]
    pub fn can_see(&self, owner: OwnerId) -> bool {
        match self {
            Self::Owner(id) => *id == owner,
            Self::HealthMonitor => true,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner(id) => write!(f, "{id}"),
            Self::HealthMonitor => f.write_str(HEALTH_MONITOR),
        }
    }
}

impl FromStr for Actor {
    type Err = switchyard_core::ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == HEALTH_MONITOR {
            Ok(Self::HealthMonitor)
        } else {
            s.parse().map(Self::Owner)
        }
    }
}

impl From<Actor> for String {
    fn from(actor: Actor) -> Self {
        actor.to_string()
    }
}

impl TryFrom<String> for Actor {
    type Error = switchyard_core::ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A lifecycle event worth recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEvent {
    Created,
    ConfigUpdated,
    Renamed,
    CredentialUpdated,
    TestSucceeded,
    TestFailed,
    Disabled,
    Reenabled,
    Deleted,
}

impl AuditEvent {
    /// Returns the persisted event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::ConfigUpdated => "config-updated",
            Self::Renamed => "renamed",
            Self::CredentialUpdated => "credential-updated",
            Self::TestSucceeded => "test-succeeded",
            Self::TestFailed => "test-failed",
            Self::Disabled => "disabled",
            Self::Reenabled => "reenabled",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Self::Created,
            "config-updated" => Self::ConfigUpdated,
            "renamed" => Self::Renamed,
            "credential-updated" => Self::CredentialUpdated,
            "test-succeeded" => Self::TestSucceeded,
            "test-failed" => Self::TestFailed,
            "disabled" => Self::Disabled,
            "reenabled" => Self::Reenabled,
            "deleted" => Self::Deleted,
            other => return Err(format!("unknown audit event '{other}'")),
        })
    }
}

/// One immutable audit record.
///
/// `detail` carries event-specific context. It never holds secret values;
/// connector text is redacted before it gets here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub integration_id: IntegrationId,
    pub event: AuditEvent,
    pub detail: Map<String, Value>,
    pub acted_by: Actor,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(integration_id: IntegrationId, event: AuditEvent, acted_by: Actor) -> Self {
        Self {
            id: AuditEntryId::new(),
            integration_id,
            event,
            detail: Map::new(),
            acted_by,
            at: Utc::now(),
        }
    }

    /// Adds one detail field.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }

    /// Merges a detail map.
    #[must_use]
    pub fn with_details(mut self, detail: Map<String, Value>) -> Self {
        self.detail.extend(detail);
        self
    }
}

/// Append-only audit storage.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable.
    async fn append(&self, entry: AuditEntry) -> Result<(), AuditError>;

    /// Lists every entry for an integration, oldest first.
    async fn list_for(&self, integration_id: IntegrationId) -> Result<Vec<AuditEntry>, AuditError>;
}
