//! Error types for the integration crate.
//!
//! Errors follow the layering of the vault:
//! - `CipherError`: authenticated encryption failures
//! - `SecretStoreError`: credential persistence and decryption failures
//! - `StoreError` / `AuditError`: persistence backends
//! - `RegistryError`: integration records and the state machine
//! - `DispatchError` / `ConnectorError`: connector resolution and probes
//! - `LifecycleError`: the façade boundary, wrapped in `rootcause::Report`
//!
//! No variant ever carries a secret value or ciphertext.

use crate::registry::IntegrationState;
use switchyard_core::IntegrationId;
use std::fmt;

/// Errors from the symmetric cipher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Ciphertext failed authentication (tampered, truncated or wrong key).
    Integrity,
    /// No key is loaded for the stored key version.
    UnknownKeyVersion { version: String },
    /// Encryption itself failed.
    EncryptionFailed { reason: String },
    /// Master secret or key ring setup is unusable.
    InvalidKeyMaterial { reason: String },
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integrity => write!(f, "ciphertext failed integrity check"),
            Self::UnknownKeyVersion { version } => write!(f, "unknown key version '{version}'"),
            Self::EncryptionFailed { reason } => write!(f, "encryption failed: {reason}"),
            Self::InvalidKeyMaterial { reason } => write!(f, "invalid key material: {reason}"),
        }
    }
}

impl std::error::Error for CipherError {}

/// Why a stored credential could not be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableCause {
    /// No credential is stored for the integration.
    Missing,
    /// The ciphertext failed its integrity check.
    Integrity,
    /// The ciphertext was produced by a key generation that is not loaded.
    UnknownKeyVersion { version: String },
    /// Decryption succeeded but the plaintext is not a secret field map.
    Malformed,
}

impl fmt::Display for UnavailableCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "no credential stored"),
            Self::Integrity => write!(f, "integrity check failed"),
            Self::UnknownKeyVersion { version } => write!(f, "unknown key version '{version}'"),
            Self::Malformed => write!(f, "malformed plaintext"),
        }
    }
}

impl From<CipherError> for UnavailableCause {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::UnknownKeyVersion { version } => Self::UnknownKeyVersion { version },
            _ => Self::Integrity,
        }
    }
}

/// Errors from the secret store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretStoreError {
    /// The credential exists in no usable form; the integration needs
    /// re-authentication.
    CredentialUnavailable {
        integration_id: IntegrationId,
        cause: UnavailableCause,
    },
    /// Encrypting the credential failed.
    EncryptionFailed { reason: String },
    /// The secret fields could not be serialized.
    SerializationFailed { reason: String },
    /// The backing store failed.
    StorageFailed { details: String },
}

impl SecretStoreError {
    /// Returns true if the integration needs new credentials.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::CredentialUnavailable { .. })
    }
}

impl fmt::Display for SecretStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CredentialUnavailable {
                integration_id,
                cause,
            } => write!(f, "credential unavailable for {integration_id}: {cause}"),
            Self::EncryptionFailed { reason } => write!(f, "credential encryption failed: {reason}"),
            Self::SerializationFailed { reason } => {
                write!(f, "credential serialization failed: {reason}")
            }
            Self::StorageFailed { details } => write!(f, "credential storage failed: {details}"),
        }
    }
}

impl std::error::Error for SecretStoreError {}

/// Errors from persistence backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another integration in the same owner scope already uses this name.
    DuplicateName { name: String },
    /// The backend failed or is unreachable.
    Unavailable { details: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateName { name } => write!(f, "display name '{name}' already in use"),
            Self::Unavailable { details } => write!(f, "store unavailable: {details}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    /// The audit backend failed or is unreachable.
    Unavailable { details: String },
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { details } => write!(f, "audit log unavailable: {details}"),
        }
    }
}

impl std::error::Error for AuditError {}

/// Errors from the integration registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Integration not found.
    NotFound { id: IntegrationId },
    /// Display name already taken within the owner scope.
    DuplicateName { name: String },
    /// The state machine forbids this transition.
    InvalidTransition {
        id: IntegrationId,
        from: IntegrationState,
        to: IntegrationState,
    },
    /// Display name is empty or too long.
    InvalidName { reason: String },
    /// Config map is not acceptable.
    InvalidConfig { reason: String },
    /// Persistence failed.
    StorageFailed { details: String },
    /// Cascading credential deletion failed.
    CredentialCascade { details: String },
    /// Writing the audit entry failed.
    AuditFailed { details: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "integration not found: {id}"),
            Self::DuplicateName { name } => write!(f, "display name '{name}' already in use"),
            Self::InvalidTransition { id, from, to } => {
                write!(f, "invalid transition for {id}: {from} -> {to}")
            }
            Self::InvalidName { reason } => write!(f, "invalid display name: {reason}"),
            Self::InvalidConfig { reason } => write!(f, "invalid config: {reason}"),
            Self::StorageFailed { details } => write!(f, "registry storage failed: {details}"),
            Self::CredentialCascade { details } => {
                write!(f, "credential deletion failed: {details}")
            }
            Self::AuditFailed { details } => write!(f, "audit write failed: {details}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateName { name } => Self::DuplicateName { name },
            StoreError::Unavailable { details } => Self::StorageFailed { details },
        }
    }
}

/// Errors from connector dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No connector is registered for the kind.
    UnsupportedKind { kind: String },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedKind { kind } => write!(f, "unsupported integration kind: {kind}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Errors from connector probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Connection to service failed.
    ConnectionFailed { reason: String },
    /// Rate limit exceeded.
    RateLimited { retry_after_secs: Option<u64> },
    /// The integration config is missing or has bad values.
    InvalidConfig { reason: String },
    /// The credential has the wrong shape for this connector.
    InvalidCredential { reason: String },
    /// Unexpected response from the remote system.
    ProtocolError { reason: String },
    /// Timeout waiting for response.
    Timeout,
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { reason } => write!(f, "connection failed: {reason}"),
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "rate limited, retry after {secs}s")
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::InvalidConfig { reason } => write!(f, "invalid connector config: {reason}"),
            Self::InvalidCredential { reason } => write!(f, "invalid credential: {reason}"),
            Self::ProtocolError { reason } => write!(f, "protocol error: {reason}"),
            Self::Timeout => write!(f, "connection test timed out"),
        }
    }
}

impl std::error::Error for ConnectorError {}

/// Coarse classification used by callers to decide on retries and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller mistake; never retried.
    Configuration,
    /// Persistence or audit unavailable; the vault refuses the write.
    Fatal,
}

/// Errors surfaced by the lifecycle controller.
///
/// This is the only vault error type visible above the controller. Cipher and
/// secret store failures never appear here; they become integration state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Integration not found (or not visible to the acting owner).
    NotFound { id: IntegrationId },
    /// No connector is registered for the kind.
    UnsupportedKind { kind: String },
    /// Display name already taken within the owner scope.
    DuplicateName { name: String },
    /// The state machine forbids this transition.
    InvalidTransition {
        id: IntegrationId,
        from: IntegrationState,
        to: IntegrationState,
    },
    /// Display name is empty or too long.
    InvalidName { reason: String },
    /// Config map is not acceptable.
    InvalidConfig { reason: String },
    /// Secret fields do not match the credential kind.
    InvalidCredential { reason: String },
    /// Persistence failed; the operation was rolled back where possible.
    StorageFailed { details: String },
    /// Writing the audit entry failed.
    AuditFailed { details: String },
    /// The in-flight test task ended without producing a result.
    TestAborted { id: IntegrationId },
}

impl LifecycleError {
    /// Classifies the error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::StorageFailed { .. } | Self::AuditFailed { .. } | Self::TestAborted { .. } => {
                ErrorClass::Fatal
            }
            _ => ErrorClass::Configuration,
        }
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "integration not found: {id}"),
            Self::UnsupportedKind { kind } => write!(f, "unsupported integration kind: {kind}"),
            Self::DuplicateName { name } => write!(f, "display name '{name}' already in use"),
            Self::InvalidTransition { id, from, to } => {
                write!(f, "invalid transition for {id}: {from} -> {to}")
            }
            Self::InvalidName { reason } => write!(f, "invalid display name: {reason}"),
            Self::InvalidConfig { reason } => write!(f, "invalid config: {reason}"),
            Self::InvalidCredential { reason } => write!(f, "invalid credential: {reason}"),
            Self::StorageFailed { details } => write!(f, "storage failed: {details}"),
            Self::AuditFailed { details } => write!(f, "audit write failed: {details}"),
            Self::TestAborted { id } => write!(f, "connection test for {id} aborted"),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<RegistryError> for LifecycleError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound { id } => Self::NotFound { id },
            RegistryError::DuplicateName { name } => Self::DuplicateName { name },
            RegistryError::InvalidTransition { id, from, to } => {
                Self::InvalidTransition { id, from, to }
            }
            RegistryError::InvalidName { reason } => Self::InvalidName { reason },
            RegistryError::InvalidConfig { reason } => Self::InvalidConfig { reason },
            RegistryError::StorageFailed { details }
            | RegistryError::CredentialCascade { details } => Self::StorageFailed { details },
            RegistryError::AuditFailed { details } => Self::AuditFailed { details },
        }
    }
}

impl From<DispatchError> for LifecycleError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::UnsupportedKind { kind } => Self::UnsupportedKind { kind },
        }
    }
}

impl From<AuditError> for LifecycleError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::Unavailable { details } => Self::AuditFailed { details },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_errors_are_distinguishable() {
        let integrity = CipherError::Integrity;
        let version = CipherError::UnknownKeyVersion {
            version: "v9".to_string(),
        };
        assert_ne!(integrity, version);
        assert!(version.to_string().contains("v9"));
        assert_eq!(UnavailableCause::from(integrity), UnavailableCause::Integrity);
        assert_eq!(
            UnavailableCause::from(version),
            UnavailableCause::UnknownKeyVersion {
                version: "v9".to_string()
            }
        );
    }

    #[test]
    fn connector_error_rate_limited() {
        let err = ConnectorError::RateLimited {
            retry_after_secs: Some(60),
        };
        assert!(err.to_string().contains("60s"));
    }

    #[test]
    fn registry_errors_map_onto_lifecycle() {
        let id = IntegrationId::new();
        let err: LifecycleError = RegistryError::InvalidTransition {
            id,
            from: IntegrationState::Disabled,
            to: IntegrationState::Active,
        }
        .into();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(err.to_string().contains("disabled -> active"));
    }

    #[test]
    fn storage_failures_are_fatal() {
        let err: LifecycleError = RegistryError::from(StoreError::Unavailable {
            details: "connection refused".to_string(),
        })
        .into();
        assert_eq!(err.class(), ErrorClass::Fatal);
    }
}
