//! Connector trait and kind-based dispatch.
//!
//! A connector knows how to probe one kind of external system. The vault
//! core never branches on kind beyond [`ConnectorDispatch::resolve`].

use crate::credential::{CredentialKind, Secret};
use crate::error::{ConnectorError, DispatchError};
use crate::registry::IntegrationKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Information about a connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorInfo {
    /// The integration kind served.
    pub kind: IntegrationKind,
    /// Human-readable name.
    pub name: String,
    /// Description of the connector.
    pub description: String,
    /// Credential kinds this connector can authenticate with.
    pub credential_kinds: Vec<CredentialKind>,
}

impl ConnectorInfo {
    /// Returns true if the connector accepts credentials of `kind`.
    #[must_use]
    pub fn accepts(&self, kind: CredentialKind) -> bool {
        self.credential_kinds.contains(&kind)
    }
}

/// Result of a live connection probe that reached the remote system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    /// Whether the remote system accepted the connection.
    pub ok: bool,
    /// Connector-specific detail.
    pub detail: Map<String, Value>,
}

impl ProbeOutcome {
    /// A successful probe.
    #[must_use]
    pub fn succeeded() -> Self {
        Self {
            ok: true,
            detail: Map::new(),
        }
    }

    /// A failed probe with a short reason, stored under `detail.reason`.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        let mut detail = Map::new();
        detail.insert("reason".to_string(), Value::String(reason.into()));
        Self { ok: false, detail }
    }

    /// Adds one detail field.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }

    /// Returns `detail.reason` if it is a string.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.detail.get("reason").and_then(Value::as_str)
    }
}

/// Trait for integration connectors.
///
/// Connectors may configure their clients with the timeout they are given,
/// but callers enforce the bound themselves.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns information about this connector.
    fn info(&self) -> ConnectorInfo;

    /// Probes the remote system with the integration's config and secret.
    ///
    /// # Errors
    ///
    /// Returns an error when the probe could not complete (bad config,
    /// transport failure). A remote rejection is a failed [`ProbeOutcome`].
    async fn test_connection(
        &self,
        config: &BTreeMap<String, String>,
        secret: &Secret,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ConnectorError>;
}

/// Maps integration kinds to connectors.
#[derive(Default)]
pub struct ConnectorDispatch {
    connectors: RwLock<HashMap<IntegrationKind, Arc<dyn Connector>>>,
}

impl ConnectorDispatch {
    /// Creates an empty dispatch table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `connector` for `kind`, replacing any previous one.
    pub fn register(&self, kind: IntegrationKind, connector: Arc<dyn Connector>) {
        debug!(kind = %kind, connector = %connector.info().name, "connector registered");
        self.connectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, connector);
    }

    /// Returns the connector for `kind`.
    ///
    /// # Errors
    ///
    /// `UnsupportedKind` when nothing is registered.
    pub fn resolve(&self, kind: IntegrationKind) -> Result<Arc<dyn Connector>, DispatchError> {
        self.connectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .ok_or_else(|| DispatchError::UnsupportedKind {
                kind: kind.to_string(),
            })
    }

    /// Lists registered connectors, ordered by kind.
    #[must_use]
    pub fn registered(&self) -> Vec<ConnectorInfo> {
        let mut infos: Vec<ConnectorInfo> = self
            .connectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|c| c.info())
            .collect();
        infos.sort_by_key(|info| info.kind);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(IntegrationKind);

    #[async_trait]
    impl Connector for Fixed {
        fn info(&self) -> ConnectorInfo {
            ConnectorInfo {
                kind: self.0,
                name: "fixed".to_string(),
                description: "always succeeds".to_string(),
                credential_kinds: vec![CredentialKind::Token],
            }
        }

        async fn test_connection(
            &self,
            _config: &BTreeMap<String, String>,
            _secret: &Secret,
            _timeout: Duration,
        ) -> Result<ProbeOutcome, ConnectorError> {
            Ok(ProbeOutcome::succeeded())
        }
    }

    #[test]
    fn resolve_registered_and_unknown() {
        let dispatch = ConnectorDispatch::new();
        dispatch.register(IntegrationKind::SourceHost, Arc::new(Fixed(IntegrationKind::SourceHost)));

        let connector = dispatch.resolve(IntegrationKind::SourceHost).expect("registered");
        assert!(connector.info().accepts(CredentialKind::Token));
        assert!(!connector.info().accepts(CredentialKind::BasicAuth));

        assert_eq!(
            dispatch.resolve(IntegrationKind::ChatPlatform).err(),
            Some(DispatchError::UnsupportedKind {
                kind: "chat-platform".to_string()
            })
        );
        assert_eq!(dispatch.registered().len(), 1);
    }

    #[test]
    fn probe_outcome_reason() {
        let failed = ProbeOutcome::failed("401").with_detail("status", 401);
        assert!(!failed.ok);
        assert_eq!(failed.reason(), Some("401"));
        assert_eq!(ProbeOutcome::succeeded().reason(), None);
    }
}
