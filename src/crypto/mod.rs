//! Authenticated encryption for OAuth tokens at rest.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CryptoEngine                       │
//! │  - keyring (active + retired keys)       │
//! │  - metadata bound as AAD                 │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (derive once)        (cached key)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Argon2id KDF                       │
//! │  - master secret + fixed salt            │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       AES-256-GCM                        │
//! │  - unique random nonce per call          │
//! │  - detached 16-byte tag                  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use credvault::crypto::{CryptoEngine, KdfParams, KeyMaterial};
//! use credvault::metadata::TokenMetadata;
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let master = std::env::var("CREDVAULT_MASTER_KEY")?;
//! let salt = std::env::var("CREDVAULT_KDF_SALT")?;
//! let key = KeyMaterial::configured("primary", master, salt)?;
//! let engine = CryptoEngine::new(key, KdfParams::default());
//!
//! let meta = TokenMetadata::issue("instagram", ["basic"], Utc::now(), Duration::days(60));
//! let blob = engine.encrypt("access-token", &meta)?;
//! assert_eq!(engine.decrypt(&blob, &meta)?, "access-token");
//! # Ok(())
//! # }
//! ```

mod encryption;
mod engine;
mod kdf;

pub use engine::{secure_compare, CryptoEngine, EngineHealth, KeyMaterial, KeySource};
pub use kdf::KdfParams;

use serde::{Deserialize, Serialize};

/// Current envelope format. Blobs carrying any other version are rejected.
pub const SCHEMA_VERSION: &str = "v1";

/// Cipher identifier reported by the health check.
pub const ALGORITHM: &str = "aes-256-gcm";

/// Cryptographic failures. Messages never contain plaintext or key bytes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("unsupported encryption schema version '{found}' (engine supports '{expected}')")]
    UnsupportedVersion { found: String, expected: String },

    #[error("no key material for key id '{0}'")]
    UnknownKey(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

/// Ciphertext envelope as stored in the `access_token`/`refresh_token` columns.
///
/// Immutable once produced; re-encrypting a token always yields a new blob
/// with a new IV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    /// Base64 ciphertext (same length as the plaintext)
    pub ciphertext: String,
    /// Base64 12-byte GCM nonce
    pub iv: String,
    /// Base64 16-byte GCM tag
    pub auth_tag: String,
    pub schema_version: String,
    pub key_id: String,
}
