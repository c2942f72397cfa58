//! Shared fixtures for unit tests.

use crate::cipher::{KeyRing, KeyVersion, MasterSecret};
use crate::credential::{CredentialRecordStore, SecretStore};
use std::sync::Arc;

/// Low iteration count so key derivation stays fast under test.
pub(crate) const TEST_ITERATIONS: u32 = 1_000;

pub(crate) fn test_ring() -> KeyRing {
    KeyRing::builder("test-salt", TEST_ITERATIONS)
        .with_key(KeyVersion::new("v1"), &MasterSecret::new("correct horse battery"))
        .expect("derive v1")
        .build(KeyVersion::new("v1"))
        .expect("build ring")
}

pub(crate) fn test_secret_store(records: Arc<dyn CredentialRecordStore>) -> SecretStore {
    SecretStore::new(Arc::new(test_ring()), records)
}
