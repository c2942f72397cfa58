//! Encrypted credential storage.
//!
//! Every integration has at most one credential: a flat map of secret fields
//! tagged with a [`CredentialKind`]. The map is serialized canonically,
//! encrypted under the active key version and persisted as an opaque blob.
//! Ciphertext and key versions never leave this module's [`SecretStore`].

use crate::cipher::{Cipher, KeyVersion};
use crate::error::{SecretStoreError, StoreError, UnavailableCause};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use switchyard_core::IntegrationId;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

/// Placeholder substituted for secret values in free text.
pub const REDACTED: &str = "[redacted]";

/// Shape of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// A single bearer token in field `token`.
    Token,
    /// Fields `username` and `password`.
    BasicAuth,
    /// Any non-empty set of named secrets.
    KeyedBundle,
}

impl CredentialKind {
    /// Returns the persisted name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::BasicAuth => "basic_auth",
            Self::KeyedBundle => "keyed_bundle",
        }
    }

    /// Checks that `fields` has the shape this kind requires.
    ///
    /// # Errors
    ///
    /// Returns a reason naming the missing field. Values are never echoed.
    pub fn validate(&self, fields: &SecretFields) -> Result<(), String> {
        let require = |name: &str| {
            if fields.get(name).is_some_and(|v| !v.is_empty()) {
                Ok(())
            } else {
                Err(format!("{} credential requires field '{name}'", self.as_str()))
            }
        };

        match self {
            Self::Token => require("token"),
            Self::BasicAuth => require("username").and_then(|()| require("password")),
            Self::KeyedBundle => {
                if fields.values().any(|v| !v.is_empty()) {
                    Ok(())
                } else {
                    Err("keyed_bundle credential requires at least one non-empty field".to_string())
                }
            }
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token" => Ok(Self::Token),
            "basic_auth" => Ok(Self::BasicAuth),
            "keyed_bundle" => Ok(Self::KeyedBundle),
            other => Err(format!("unknown credential kind '{other}'")),
        }
    }
}

/// Secret field map. Values are wiped on drop and hidden from `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretFields(BTreeMap<String, String>);

impl SecretFields {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if let Some(mut old) = self.0.insert(name.into(), value.into()) {
            old.zeroize();
        }
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Iterates over field names and values in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Iterates over field values.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical byte form: a JSON object with sorted keys.
    fn to_canonical_bytes(&self) -> Result<Zeroizing<Vec<u8>>, SecretStoreError> {
        serde_json::to_vec(&self.0)
            .map(Zeroizing::new)
            .map_err(|e| SecretStoreError::SerializationFailed {
                reason: e.to_string(),
            })
    }

    fn from_canonical_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok().map(Self)
    }

    /// Replaces every occurrence of every non-empty field value in `text`
    /// with [`REDACTED`].
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        // Longest first, so a value that contains another is replaced whole.
        let mut values: Vec<&str> = self.values().filter(|v| !v.is_empty()).collect();
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));

        let mut out = text.to_string();
        for value in values {
            if out.contains(value) {
                out = out.replace(value, REDACTED);
            }
        }
        out
    }

    /// Redacts every string inside a JSON value, keys included.
    #[must_use]
    pub fn redact_json(&self, value: serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(s) => Value::String(self.redact(&s)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.redact_json(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (self.redact(&k), self.redact_json(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl Drop for SecretFields {
    fn drop(&mut self) {
        for value in self.0.values_mut() {
            value.zeroize();
        }
    }
}

impl fmt::Debug for SecretFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, REDACTED)))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SecretFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Self::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

/// A decrypted credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub kind: CredentialKind,
    pub fields: SecretFields,
}

/// Kind-discriminated view of a credential, for connectors.
#[derive(Clone, Copy)]
pub enum AuthMaterial<'a> {
    Bearer { token: &'a str },
    Basic { username: &'a str, password: &'a str },
    Bundle { fields: &'a SecretFields },
}

impl fmt::Debug for AuthMaterial<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer { .. } => f.write_str("Bearer([redacted])"),
            Self::Basic { .. } => f.write_str("Basic([redacted])"),
            Self::Bundle { fields } => write!(f, "Bundle({fields:?})"),
        }
    }
}

impl Secret {
    /// Returns the credential as connector-facing auth material.
    ///
    /// Fields are checked at write time, so missing fields read as empty.
    #[must_use]
    pub fn auth(&self) -> AuthMaterial<'_> {
        match self.kind {
            CredentialKind::Token => AuthMaterial::Bearer {
                token: self.field("token"),
            },
            CredentialKind::BasicAuth => AuthMaterial::Basic {
                username: self.field("username"),
                password: self.field("password"),
            },
            CredentialKind::KeyedBundle => AuthMaterial::Bundle {
                fields: &self.fields,
            },
        }
    }
}

impl Secret {
    fn field(&self, name: &str) -> &str {
        self.fields.get(name).unwrap_or_default()
    }
}

/// A persisted credential record. Opaque outside the secret store.
#[derive(Clone, PartialEq, Eq)]
pub struct StoredCredential {
    pub kind: CredentialKind,
    pub ciphertext: Vec<u8>,
    pub key_version: KeyVersion,
}

impl fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredential")
            .field("kind", &self.kind)
            .field("ciphertext", &REDACTED)
            .field("key_version", &self.key_version)
            .finish()
    }
}

/// Persistence for encrypted credential records, one per integration.
#[async_trait]
pub trait CredentialRecordStore: Send + Sync {
    /// Inserts or replaces the record for an integration.
    async fn upsert(&self, id: IntegrationId, record: &StoredCredential) -> Result<(), StoreError>;

    /// Loads the record for an integration.
    async fn load(&self, id: IntegrationId) -> Result<Option<StoredCredential>, StoreError>;

    /// Removes the record. Removing a missing record is not an error.
    async fn remove(&self, id: IntegrationId) -> Result<(), StoreError>;

    /// Lists integrations whose record was written under a version other
    /// than `active`.
    async fn list_stale(&self, active: &KeyVersion) -> Result<Vec<IntegrationId>, StoreError>;
}

/// Outcome of a bulk re-wrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewrapSummary {
    /// Records re-encrypted under the active version.
    pub rewrapped: usize,
    /// Unreadable records left untouched.
    pub skipped: usize,
}

/// Encrypts, persists and decrypts integration credentials.
#[derive(Clone)]
pub struct SecretStore {
    cipher: Arc<dyn Cipher>,
    records: Arc<dyn CredentialRecordStore>,
}

impl SecretStore {
    /// Creates a store over a cipher and a record backend.
    #[must_use]
    pub fn new(cipher: Arc<dyn Cipher>, records: Arc<dyn CredentialRecordStore>) -> Self {
        Self { cipher, records }
    }

    /// Binds a ciphertext to its integration and credential kind.
    fn associated_data(id: IntegrationId, kind: CredentialKind) -> Vec<u8> {
        format!("{id}:{kind}").into_bytes()
    }

    fn storage(e: StoreError) -> SecretStoreError {
        SecretStoreError::StorageFailed {
            details: e.to_string(),
        }
    }

    /// Encrypts and stores `fields`, replacing any previous credential.
    ///
    /// # Errors
    ///
    /// `SerializationFailed`, `EncryptionFailed` or `StorageFailed`.
    pub async fn put(
        &self,
        id: IntegrationId,
        kind: CredentialKind,
        fields: &SecretFields,
    ) -> Result<(), SecretStoreError> {
        let plaintext = fields.to_canonical_bytes()?;
        let sealed = self
            .cipher
            .encrypt(&plaintext, &Self::associated_data(id, kind))
            .map_err(|e| SecretStoreError::EncryptionFailed {
                reason: e.to_string(),
            })?;

        let record = StoredCredential {
            kind,
            ciphertext: sealed.ciphertext,
            key_version: sealed.key_version,
        };
        self.records.upsert(id, &record).await.map_err(Self::storage)?;

        debug!(integration_id = %id, kind = %kind, key_version = %record.key_version, "credential stored");
        Ok(())
    }

    /// Loads and decrypts the credential for an integration.
    ///
    /// # Errors
    ///
    /// `CredentialUnavailable` when there is no record or it cannot be
    /// decrypted; `StorageFailed` when the backend fails.
    pub async fn get(&self, id: IntegrationId) -> Result<Secret, SecretStoreError> {
        let record = self.records.load(id).await.map_err(Self::storage)?;
        let Some(record) = record else {
            return Err(SecretStoreError::CredentialUnavailable {
                integration_id: id,
                cause: UnavailableCause::Missing,
            });
        };
        self.open(id, &record)
    }

    fn open(&self, id: IntegrationId, record: &StoredCredential) -> Result<Secret, SecretStoreError> {
        let plaintext = self
            .cipher
            .decrypt(
                &record.ciphertext,
                &record.key_version,
                &Self::associated_data(id, record.kind),
            )
            .map_err(|e| SecretStoreError::CredentialUnavailable {
                integration_id: id,
                cause: e.into(),
            })?;

        let fields = SecretFields::from_canonical_bytes(&plaintext).ok_or(
            SecretStoreError::CredentialUnavailable {
                integration_id: id,
                cause: UnavailableCause::Malformed,
            },
        )?;

        Ok(Secret {
            kind: record.kind,
            fields,
        })
    }

    /// Deletes the credential for an integration. Idempotent.
    ///
    /// # Errors
    ///
    /// `StorageFailed`.
    pub async fn delete(&self, id: IntegrationId) -> Result<(), SecretStoreError> {
        self.records.remove(id).await.map_err(Self::storage)
    }

    /// Re-encrypts one credential under the active key version.
    ///
    /// Returns true if the record was rewritten, false if it was already
    /// current.
    ///
    /// # Errors
    ///
    /// `CredentialUnavailable` when the record is missing or unreadable.
    pub async fn rewrap(&self, id: IntegrationId) -> Result<bool, SecretStoreError> {
        let record = self.records.load(id).await.map_err(Self::storage)?;
        let Some(record) = record else {
            return Err(SecretStoreError::CredentialUnavailable {
                integration_id: id,
                cause: UnavailableCause::Missing,
            });
        };
        if &record.key_version == self.cipher.active_version() {
            return Ok(false);
        }

        let secret = self.open(id, &record)?;
        self.put(id, secret.kind, &secret.fields).await?;
        Ok(true)
    }

    /// Re-encrypts every credential written under an older key version.
    ///
    /// Unreadable records are counted and left in place.
    ///
    /// # Errors
    ///
    /// `StorageFailed` when the backend fails.
    pub async fn rewrap_stale(&self) -> Result<RewrapSummary, SecretStoreError> {
        let active = self.cipher.active_version().clone();
        let stale = self.records.list_stale(&active).await.map_err(Self::storage)?;

        let mut summary = RewrapSummary::default();
        for id in stale {
            match self.rewrap(id).await {
                Ok(true) => summary.rewrapped += 1,
                Ok(false) => {}
                Err(e) if e.is_unavailable() => {
                    warn!(integration_id = %id, error = %e, "skipping unreadable credential during re-wrap");
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            active_key_version = %active,
            rewrapped = summary.rewrapped,
            skipped = summary.skipped,
            "credential re-wrap finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{KeyRing, MasterSecret};
    use crate::memory::InMemoryCredentialStore;
    use crate::testing::{TEST_ITERATIONS, test_secret_store};
    use proptest::prelude::*;

    fn token(value: &str) -> SecretFields {
        SecretFields::from_iter([("token", value)])
    }

    #[test]
    fn kind_validation() {
        assert!(CredentialKind::Token.validate(&token("abc")).is_ok());
        assert!(CredentialKind::Token.validate(&token("")).is_err());
        assert!(
            CredentialKind::BasicAuth
                .validate(&SecretFields::from_iter([("username", "u")]))
                .is_err()
        );
        assert!(
            CredentialKind::BasicAuth
                .validate(&SecretFields::from_iter([("username", "u"), ("password", "p")]))
                .is_ok()
        );
        assert!(CredentialKind::KeyedBundle.validate(&SecretFields::new()).is_err());
        assert!(
            CredentialKind::KeyedBundle
                .validate(&SecretFields::from_iter([("x-api-key", "k")]))
                .is_ok()
        );
    }

    #[test]
    fn debug_hides_values() {
        let fields = SecretFields::from_iter([("token", "s3cr3t-value")]);
        let rendered = format!("{fields:?}");
        assert!(rendered.contains("token"));
        assert!(!rendered.contains("s3cr3t-value"));
    }

    #[test]
    fn redaction_prefers_longest_value() {
        let fields = SecretFields::from_iter([("a", "abc"), ("b", "abcdef")]);
        assert_eq!(
            fields.redact("got abcdef and abc"),
            "got [redacted] and [redacted]"
        );
        let json = fields.redact_json(serde_json::json!({"msg": ["abc"], "n": 1}));
        assert_eq!(json, serde_json::json!({"msg": ["[redacted]"], "n": 1}));
    }

    #[test]
    fn auth_material_by_kind() {
        let secret = Secret {
            kind: CredentialKind::BasicAuth,
            fields: SecretFields::from_iter([("username", "u"), ("password", "p")]),
        };
        assert!(matches!(
            secret.auth(),
            AuthMaterial::Basic {
                username: "u",
                password: "p"
            }
        ));
    }

    #[tokio::test]
    async fn put_get_replace() {
        let records = Arc::new(InMemoryCredentialStore::new());
        let store = test_secret_store(records.clone());
        let id = IntegrationId::new();

        store.put(id, CredentialKind::Token, &token("abc")).await.expect("put");
        let stored = records.load(id).await.expect("load").expect("record");
        assert!(
            !stored
                .ciphertext
                .windows(3)
                .any(|w| w == b"abc"),
            "plaintext must not be persisted"
        );

        store.put(id, CredentialKind::Token, &token("def")).await.expect("replace");
        let secret = store.get(id).await.expect("get");
        assert_eq!(secret.kind, CredentialKind::Token);
        assert_eq!(secret.fields, token("def"));
    }

    #[tokio::test]
    async fn missing_and_deleted_are_unavailable() {
        let store = test_secret_store(Arc::new(InMemoryCredentialStore::new()));
        let id = IntegrationId::new();

        assert_eq!(
            store.get(id).await,
            Err(SecretStoreError::CredentialUnavailable {
                integration_id: id,
                cause: UnavailableCause::Missing
            })
        );

        store.put(id, CredentialKind::Token, &token("abc")).await.expect("put");
        store.delete(id).await.expect("delete");
        store.delete(id).await.expect("second delete");
        assert!(store.get(id).await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn tampered_record_is_integrity_failure() {
        let records = Arc::new(InMemoryCredentialStore::new());
        let store = test_secret_store(records.clone());
        let id = IntegrationId::new();
        store.put(id, CredentialKind::Token, &token("abc")).await.expect("put");

        let mut record = records.load(id).await.expect("load").expect("record");
        let last = record.ciphertext.len() - 1;
        record.ciphertext[last] ^= 0x01;
        records.upsert(id, &record).await.expect("tamper");

        assert_eq!(
            store.get(id).await,
            Err(SecretStoreError::CredentialUnavailable {
                integration_id: id,
                cause: UnavailableCause::Integrity
            })
        );
    }

    #[tokio::test]
    async fn record_copied_to_other_integration_fails() {
        let records = Arc::new(InMemoryCredentialStore::new());
        let store = test_secret_store(records.clone());
        let (a, b) = (IntegrationId::new(), IntegrationId::new());
        store.put(a, CredentialKind::Token, &token("abc")).await.expect("put");

        let record = records.load(a).await.expect("load").expect("record");
        records.upsert(b, &record).await.expect("copy");
        assert!(store.get(b).await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn rotation_and_rewrap() {
        let records = Arc::new(InMemoryCredentialStore::new());
        let old = test_secret_store(records.clone());
        let id = IntegrationId::new();
        old.put(id, CredentialKind::Token, &token("abc")).await.expect("put");

        let rotated_ring = KeyRing::builder("test-salt", TEST_ITERATIONS)
            .with_key(KeyVersion::new("v1"), &MasterSecret::new("correct horse battery"))
            .and_then(|b| b.with_key(KeyVersion::new("v2"), &MasterSecret::new("next generation")))
            .and_then(|b| b.build(KeyVersion::new("v2")))
            .expect("ring");
        let rotated = SecretStore::new(Arc::new(rotated_ring), records.clone());

        // Still readable under the rotated ring before any re-wrap.
        assert_eq!(rotated.get(id).await.expect("get").fields, token("abc"));

        let broken = IntegrationId::new();
        records
            .upsert(
                broken,
                &StoredCredential {
                    kind: CredentialKind::Token,
                    ciphertext: vec![0u8; 40],
                    key_version: KeyVersion::new("v1"),
                },
            )
            .await
            .expect("seed broken record");

        let summary = rotated.rewrap_stale().await.expect("rewrap");
        assert_eq!(
            summary,
            RewrapSummary {
                rewrapped: 1,
                skipped: 1
            }
        );
        let record = records.load(id).await.expect("load").expect("record");
        assert_eq!(record.key_version, KeyVersion::new("v2"));
        assert_eq!(rotated.rewrap(id).await, Ok(false));
        assert!(records.load(broken).await.expect("load").is_some());

        // The old ring no longer knows the active version.
        assert_eq!(
            old.get(id).await,
            Err(SecretStoreError::CredentialUnavailable {
                integration_id: id,
                cause: UnavailableCause::UnknownKeyVersion {
                    version: "v2".to_string()
                }
            })
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn put_then_get_round_trips(
            fields in proptest::collection::btree_map("[a-z_]{1,12}", ".{0,40}", 1..6)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            let store = test_secret_store(Arc::new(InMemoryCredentialStore::new()));
            let id = IntegrationId::new();
            let expected = SecretFields::from_iter(fields);

            let got = rt.block_on(async {
                store.put(id, CredentialKind::KeyedBundle, &expected).await.expect("put");
                store.get(id).await.expect("get")
            });
            prop_assert_eq!(got.fields, expected);
        }
    }
}
