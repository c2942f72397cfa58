//! Authenticated encryption for credential material.
//!
//! Keys are derived once at startup from externally supplied master secrets
//! (one per key generation) with PBKDF2-HMAC-SHA256 and a fixed iteration
//! count. The salt is the per-deployment salt joined with the key version
//! label, so it is fixed for the life of each version.
//!
//! Ciphertexts are AES-256-GCM with a random 96-bit nonce, laid out as
//! `nonce || ciphertext || tag`. Callers may bind a ciphertext to a context
//! through associated data.

use crate::error::CipherError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use zeroize::Zeroizing;

/// Iteration count used when the deployment does not override it.
pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

/// Lowest iteration count accepted from deployment configuration.
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Identifies the master-key generation that produced a ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyVersion(String);

impl KeyVersion {
    /// Creates a key version label.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Returns the label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A master secret as supplied by the environment or a secret manager.
///
/// Never generated, displayed or logged by the vault.
pub struct MasterSecret(Zeroizing<Vec<u8>>);

impl MasterSecret {
    /// Wraps raw secret bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret([redacted])")
    }
}

impl<'de> Deserialize<'de> for MasterSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw.into_bytes()))
    }
}

/// Key ring configuration, loaded once at startup.
#[derive(Debug, Deserialize)]
pub struct KeyRingConfig {
    /// Version used for all new encryptions.
    #[serde(default = "default_active_key_version")]
    pub active_key_version: String,
    /// Per-deployment salt.
    pub kdf_salt: String,
    /// PBKDF2 iteration count.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    /// Master secret per key version label.
    #[serde(default)]
    pub master_secrets: HashMap<String, MasterSecret>,
    /// Re-encrypt credentials under the active version at startup.
    #[serde(default)]
    pub rewrap_on_start: bool,
}

fn default_active_key_version() -> String {
    "v1".to_string()
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}

/// Output of an encryption: the bytes to persist and the version that made them.
#[derive(Clone, PartialEq, Eq)]
pub struct Sealed {
    /// `nonce || ciphertext || tag`.
    pub ciphertext: Vec<u8>,
    /// Key generation used.
    pub key_version: KeyVersion,
}

impl fmt::Debug for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealed")
            .field("ciphertext", &format_args!("<{} bytes>", self.ciphertext.len()))
            .field("key_version", &self.key_version)
            .finish()
    }
}

/// Symmetric authenticated encryption over process-wide key material.
pub trait Cipher: Send + Sync {
    /// Encrypts `plaintext` under the active key, binding `aad`.
    ///
    /// # Errors
    ///
    /// Returns an error if the active key is missing or the AEAD fails.
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CipherError>;

    /// Decrypts a ciphertext produced under `key_version` with the same `aad`.
    ///
    /// # Errors
    ///
    /// `UnknownKeyVersion` when no key is loaded for the version, `Integrity`
    /// when authentication fails.
    fn decrypt(
        &self,
        ciphertext: &[u8],
        key_version: &KeyVersion,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CipherError>;

    /// Returns the version used for new encryptions.
    fn active_version(&self) -> &KeyVersion;
}

struct DerivedKey(Zeroizing<[u8; KEY_LEN]>);

impl DerivedKey {
    fn derive(secret: &MasterSecret, salt: &str, version: &KeyVersion, iterations: u32) -> Self {
        let salt = format!("{salt}:{version}");
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.expose(), salt.as_bytes(), iterations, key.as_mut());
        Self(key)
    }

    fn aead(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.0.as_ref()))
    }
}

/// The process-wide set of derived keys.
///
/// Immutable after construction; rotation means building a ring with a new
/// active version, never changing a key in place.
pub struct KeyRing {
    active: KeyVersion,
    keys: HashMap<KeyVersion, DerivedKey>,
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut versions: Vec<&str> = self.keys.keys().map(KeyVersion::as_str).collect();
        versions.sort_unstable();
        f.debug_struct("KeyRing")
            .field("active", &self.active)
            .field("versions", &versions)
            .finish()
    }
}

impl KeyRing {
    /// Starts a key ring with the given salt and iteration count.
    #[must_use]
    pub fn builder(salt: impl Into<String>, iterations: u32) -> KeyRingBuilder {
        KeyRingBuilder {
            salt: salt.into(),
            iterations,
            keys: HashMap::new(),
        }
    }

    /// Derives every configured key version.
    ///
    /// # Errors
    ///
    /// Fails when the salt is empty, the iteration count is below
    /// [`MIN_KDF_ITERATIONS`], any secret is empty, or the active version has
    /// no secret.
    pub fn from_config(config: &KeyRingConfig) -> Result<Self, CipherError> {
        if config.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(CipherError::InvalidKeyMaterial {
                reason: format!(
                    "kdf_iterations must be at least {MIN_KDF_ITERATIONS}, got {}",
                    config.kdf_iterations
                ),
            });
        }

        let mut builder = Self::builder(config.kdf_salt.clone(), config.kdf_iterations);
        for (version, secret) in &config.master_secrets {
            builder = builder.with_key(KeyVersion::new(version.clone()), secret)?;
        }
        builder.build(KeyVersion::new(config.active_key_version.clone()))
    }

    /// Returns every loaded key version.
    #[must_use]
    pub fn versions(&self) -> Vec<KeyVersion> {
        let mut versions: Vec<KeyVersion> = self.keys.keys().cloned().collect();
        versions.sort();
        versions
    }
}

impl Cipher for KeyRing {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CipherError> {
        let key = self
            .keys
            .get(&self.active)
            .ok_or_else(|| CipherError::UnknownKeyVersion {
                version: self.active.to_string(),
            })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let body = key
            .aead()
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|e| CipherError::EncryptionFailed {
                reason: e.to_string(),
            })?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + body.len());
        ciphertext.extend_from_slice(nonce.as_slice());
        ciphertext.extend_from_slice(&body);

        Ok(Sealed {
            ciphertext,
            key_version: self.active.clone(),
        })
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        key_version: &KeyVersion,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let key = self
            .keys
            .get(key_version)
            .ok_or_else(|| CipherError::UnknownKeyVersion {
                version: key_version.to_string(),
            })?;

        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Integrity);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);

        key.aead()
            .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad })
            .map(Zeroizing::new)
            .map_err(|_| CipherError::Integrity)
    }

    fn active_version(&self) -> &KeyVersion {
        &self.active
    }
}

/// Builder for [`KeyRing`].
pub struct KeyRingBuilder {
    salt: String,
    iterations: u32,
    keys: HashMap<KeyVersion, DerivedKey>,
}

impl KeyRingBuilder {
    /// Derives and adds the key for `version`.
    ///
    /// # Errors
    ///
    /// Fails on an empty secret, an empty salt or a zero iteration count.
    pub fn with_key(mut self, version: KeyVersion, secret: &MasterSecret) -> Result<Self, CipherError> {
        if secret.expose().is_empty() {
            return Err(CipherError::InvalidKeyMaterial {
                reason: format!("master secret for {version} is empty"),
            });
        }
        if self.salt.is_empty() {
            return Err(CipherError::InvalidKeyMaterial {
                reason: "kdf salt is empty".to_string(),
            });
        }
        if self.iterations == 0 {
            return Err(CipherError::InvalidKeyMaterial {
                reason: "kdf iteration count is zero".to_string(),
            });
        }

        let key = DerivedKey::derive(secret, &self.salt, &version, self.iterations);
        self.keys.insert(version, key);
        Ok(self)
    }

    /// Finishes the ring with `active` as the encryption version.
    ///
    /// # Errors
    ///
    /// Fails when no key was added for `active`.
    pub fn build(self, active: KeyVersion) -> Result<KeyRing, CipherError> {
        if !self.keys.contains_key(&active) {
            return Err(CipherError::InvalidKeyMaterial {
                reason: format!("no master secret for active key version {active}"),
            });
        }
        Ok(KeyRing {
            active,
            keys: self.keys,
        })
    }
}
