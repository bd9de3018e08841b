//! The token encryption engine and its keyring.

use once_cell::sync::OnceCell;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::encryption::{self, KEY_SIZE};
use super::kdf::{self, KdfParams};
use super::{CryptoError, EncryptedBlob, ALGORITHM, SCHEMA_VERSION};
use crate::metadata::TokenMetadata;

/// Minimum length of a configured master secret, in bytes.
pub const MIN_MASTER_SECRET_LEN: usize = 32;

/// Minimum length of a configured KDF salt, in bytes.
pub const MIN_SALT_LEN: usize = 16;

/// Where a key's master secret came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Supplied by the operator (environment / secret store).
    Configured,
    /// Generated at startup for local development; lost on restart.
    Ephemeral,
}

/// Master secret and salt for one key id.
pub struct KeyMaterial {
    key_id: String,
    master_secret: Zeroizing<Vec<u8>>,
    salt: Vec<u8>,
    source: KeySource,
}

impl KeyMaterial {
    /// Key material supplied by the operator. Rejects secrets and salts that
    /// are too short to be meaningful.
    pub fn configured(
        key_id: impl Into<String>,
        master_secret: impl Into<Vec<u8>>,
        salt: impl Into<Vec<u8>>,
    ) -> Result<Self, CryptoError> {
        let key_id = key_id.into();
        let master_secret = Zeroizing::new(master_secret.into());
        let salt = salt.into();

        if key_id.trim().is_empty() {
            return Err(CryptoError::InvalidKeyMaterial("key id is empty".to_string()));
        }
        if master_secret.len() < MIN_MASTER_SECRET_LEN {
            return Err(CryptoError::InvalidKeyMaterial(format!(
                "master secret must be at least {} bytes, got {}",
                MIN_MASTER_SECRET_LEN,
                master_secret.len()
            )));
        }
        if salt.len() < MIN_SALT_LEN {
            return Err(CryptoError::InvalidKeyMaterial(format!(
                "KDF salt must be at least {} bytes, got {}",
                MIN_SALT_LEN,
                salt.len()
            )));
        }

        Ok(Self {
            key_id,
            master_secret,
            salt,
            source: KeySource::Configured,
        })
    }

    /// Random key material for development. Anything encrypted with it is
    /// unreadable after the process exits.
    pub fn ephemeral(key_id: impl Into<String>) -> Self {
        let mut secret = Zeroizing::new(vec![0u8; MIN_MASTER_SECRET_LEN]);
        OsRng.fill_bytes(&mut secret);
        let mut salt = vec![0u8; MIN_SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        Self {
            key_id: key_id.into(),
            master_secret: secret,
            salt,
            source: KeySource::Ephemeral,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn source(&self) -> KeySource {
        self.source
    }

    fn looks_configured(&self) -> bool {
        self.source == KeySource::Configured
            && self.master_secret.len() >= MIN_MASTER_SECRET_LEN
            && self.salt.len() >= MIN_SALT_LEN
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("source", &self.source)
            .field("master_secret", &"[REDACTED]")
            .finish()
    }
}

/// A key id, its material, and the lazily derived key.
struct KeySlot {
    material: KeyMaterial,
    derived: OnceCell<Zeroizing<[u8; KEY_SIZE]>>,
}

impl KeySlot {
    fn new(material: KeyMaterial) -> Self {
        Self {
            material,
            derived: OnceCell::new(),
        }
    }

    /// Derives on first use; concurrent first callers block on one derivation.
    fn key(&self, params: KdfParams) -> Result<&[u8; KEY_SIZE], CryptoError> {
        let key = self.derived.get_or_try_init(|| {
            debug!(key_id = %self.material.key_id, "Deriving token encryption key");
            kdf::derive_key(&self.material.master_secret, &self.material.salt, params)
        })?;
        Ok(&**key)
    }
}

/// Read-only status report of the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub status: String,
    pub version: String,
    pub key_id: String,
    pub algorithm: String,
    pub kdf: String,
    pub key_configured: bool,
    pub key_source: KeySource,
    pub retired_key_ids: Vec<String>,
}

/// Encrypts and decrypts token strings with AES-256-GCM, binding
/// [`TokenMetadata`] as additional authenticated data.
///
/// Construct one per process and share it behind an `Arc`; all methods take
/// `&self` and the derived keys are immutable after first derivation.
pub struct CryptoEngine {
    active_key_id: String,
    slots: HashMap<String, KeySlot>,
    kdf: KdfParams,
}

impl CryptoEngine {
    /// Creates an engine that encrypts with `active`.
    pub fn new(active: KeyMaterial, kdf: KdfParams) -> Self {
        if active.source() == KeySource::Ephemeral {
            warn!(
                key_id = %active.key_id(),
                "Using an ephemeral encryption key; stored credentials will not survive a restart"
            );
        }

        let active_key_id = active.key_id().to_string();
        let mut slots = HashMap::new();
        slots.insert(active_key_id.clone(), KeySlot::new(active));

        Self {
            active_key_id,
            slots,
            kdf,
        }
    }

    /// Adds a key that is only used to decrypt blobs written before a key
    /// rotation.
    pub fn with_retired_key(mut self, material: KeyMaterial) -> Result<Self, CryptoError> {
        if self.slots.contains_key(material.key_id()) {
            return Err(CryptoError::InvalidKeyMaterial(format!(
                "duplicate key id '{}'",
                material.key_id()
            )));
        }
        self.slots
            .insert(material.key_id().to_string(), KeySlot::new(material));
        Ok(self)
    }

    /// Identifier of the key new blobs are encrypted with.
    pub fn key_id(&self) -> &str {
        &self.active_key_id
    }

    /// Returns the active derived key, deriving it on first call.
    pub fn derive_key(&self) -> Result<&[u8; KEY_SIZE], CryptoError> {
        self.slot(&self.active_key_id)?.key(self.kdf)
    }

    /// Encrypts `plaintext` under the active key with `metadata` as AAD.
    pub fn encrypt(
        &self,
        plaintext: &str,
        metadata: &TokenMetadata,
    ) -> Result<EncryptedBlob, CryptoError> {
        let key = self.derive_key().map_err(|e| match e {
            CryptoError::KeyDerivation(msg) => {
                CryptoError::Encryption(format!("key derivation failed: {}", msg))
            }
            other => CryptoError::Encryption(other.to_string()),
        })?;

        let aad = associated_data(SCHEMA_VERSION, &self.active_key_id, metadata);
        let sealed = encryption::encrypt(plaintext, &aad, key)?;

        Ok(EncryptedBlob {
            ciphertext: sealed.ciphertext,
            iv: sealed.nonce,
            auth_tag: sealed.tag,
            schema_version: SCHEMA_VERSION.to_string(),
            key_id: self.active_key_id.clone(),
        })
    }

    /// Verifies and decrypts `blob`. `metadata` must be exactly what was
    /// bound at encryption time.
    pub fn decrypt(&self, blob: &EncryptedBlob, metadata: &TokenMetadata) -> Result<String, CryptoError> {
        if blob.schema_version != SCHEMA_VERSION {
            return Err(CryptoError::UnsupportedVersion {
                found: blob.schema_version.clone(),
                expected: SCHEMA_VERSION.to_string(),
            });
        }

        let key = self
            .slot(&blob.key_id)?
            .key(self.kdf)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;

        let aad = associated_data(&blob.schema_version, &blob.key_id, metadata);
        encryption::decrypt(&blob.ciphertext, &blob.iv, &blob.auth_tag, &aad, key)
    }

    /// Operational status. Only inspects whether key material is present and
    /// long enough; never derives or reads a key.
    pub fn health_status(&self) -> EngineHealth {
        let active = self.slots.get(&self.active_key_id).map(|slot| &slot.material);
        let key_configured = active.map(KeyMaterial::looks_configured).unwrap_or(false);
        let key_source = active.map(KeyMaterial::source).unwrap_or(KeySource::Ephemeral);

        let mut retired_key_ids: Vec<String> = self
            .slots
            .keys()
            .filter(|id| **id != self.active_key_id)
            .cloned()
            .collect();
        retired_key_ids.sort();

        EngineHealth {
            status: if key_configured { "healthy" } else { "degraded" }.to_string(),
            version: SCHEMA_VERSION.to_string(),
            key_id: self.active_key_id.clone(),
            algorithm: ALGORITHM.to_string(),
            kdf: "argon2id".to_string(),
            key_configured,
            key_source,
            retired_key_ids,
        }
    }

    fn slot(&self, key_id: &str) -> Result<&KeySlot, CryptoError> {
        self.slots
            .get(key_id)
            .ok_or_else(|| CryptoError::UnknownKey(key_id.to_string()))
    }
}

/// AAD layout: `{version}|{key_id}|{canonical metadata}`.
fn associated_data(version: &str, key_id: &str, metadata: &TokenMetadata) -> Vec<u8> {
    let mut aad = Vec::with_capacity(version.len() + key_id.len() + 128);
    aad.extend_from_slice(version.as_bytes());
    aad.push(b'|');
    aad.extend_from_slice(key_id.as_bytes());
    aad.push(b'|');
    aad.extend_from_slice(&metadata.canonical_bytes());
    aad
}

/// Constant-time string equality.
///
/// Work depends only on the length of `a`: with equal lengths the two inputs
/// are compared in full, otherwise `a` is compared against itself and the
/// length mismatch decides the result.
pub fn secure_compare(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();

    let same_len = (a.len() as u64).ct_eq(&(b.len() as u64));
    let rhs = if a.len() == b.len() { b } else { a };
    let same_content = a.ct_eq(rhs);

    (same_len & same_content).into()
}

#[cfg(test)]
mod tests;
