//! Credential vault and integration lifecycle for switchyard.
//!
//! This crate provides:
//!
//! - **Cipher**: Versioned AES-256-GCM key ring for secrets at rest
//! - **Secret store**: Encrypted credential records bound to their integration
//! - **Registry**: Integration records and their state machine
//! - **Audit log**: Append-only trail of lifecycle events
//! - **Connectors**: Kind-dispatched connection probes for external systems
//! - **Lifecycle controller**: The operations callers use, serialized per integration
//!
//! Persistence is behind traits; [`memory`] holds in-process implementations.

pub mod audit;
pub mod cipher;
pub mod connector;
pub mod connectors;
pub mod credential;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod registry;

#[cfg(test)]
mod testing;

pub use audit::{Actor, AuditEntry, AuditEvent, AuditLog};
pub use cipher::{Cipher, KeyRing, KeyRingConfig, KeyVersion};
pub use connector::{Connector, ConnectorDispatch, ConnectorInfo, ProbeOutcome};
pub use credential::{
    CredentialKind, CredentialRecordStore, Secret, SecretFields, SecretStore, StoredCredential,
};
pub use error::{ErrorClass, LifecycleError};
pub use lifecycle::{LifecycleConfig, LifecycleController, NewIntegration, TestReport};
pub use registry::{
    Integration, IntegrationKind, IntegrationRegistry, IntegrationState, IntegrationStore,
    ListFilter, StateWrite,
};
