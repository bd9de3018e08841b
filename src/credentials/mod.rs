//! Encrypted credential lifecycle for connected platform accounts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialLifecycleManager         │
//! │  - store / get / list                    │
//! │  - rotation policy + rotate              │
//! │  - revoke / health                       │
//! └─────────────────────────────────────────┘
//!     ↓ encrypt/decrypt    ↓ refresh      ↓ persist
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐
//! │ CryptoEngine │  │  Platform    │  │ Credential       │
//! │              │  │  Refresher   │  │ Repository       │
//! └──────────────┘  └──────────────┘  └──────────────────┘
//! ```
//!
//! # State machine
//!
//! ```text
//! [none] --store--> connected
//! connected --rotate(success)--> connected (rotation_count + 1)
//! connected --rotate(no refresh token)--> reauth_required
//! connected --rotate(collaborator failure)--> connected (unchanged)
//! connected --rotate(refresh token unreadable)--> error
//! connected | reauth_required | error --revoke--> disconnected
//! ```
//!
//! Records are never deleted here; revocation nulls the secrets and keeps
//! the row for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{CryptoError, EncryptedBlob};
use crate::metadata::TokenMetadata;

mod lifecycle;
mod policy;
mod storage;

pub use lifecycle::{CredentialLifecycleManager, Timeouts};
pub use policy::RotationPolicy;
pub use storage::{CredentialRepository, RotationUpdate, SqliteCredentialStore};

/// Connection state of a credential record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Connected,
    Disconnected,
    ReauthRequired,
    Error,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Connected => "connected",
            CredentialStatus::Disconnected => "disconnected",
            CredentialStatus::ReauthRequired => "reauth_required",
            CredentialStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "connected" => Some(CredentialStatus::Connected),
            "disconnected" => Some(CredentialStatus::Disconnected),
            "reauth_required" => Some(CredentialStatus::ReauthRequired),
            "error" => Some(CredentialStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable credential record, secrets still encrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub id: String,
    pub owner_user_id: String,
    pub organization_id: Option<String>,
    pub platform: String,
    pub external_username: String,
    /// `None` only after revocation
    pub encrypted_access_token: Option<EncryptedBlob>,
    pub encrypted_refresh_token: Option<EncryptedBlob>,
    pub metadata: TokenMetadata,
    /// Mirrors `metadata.expires_at` until revocation nulls it
    pub token_expires_at: Option<DateTime<Utc>>,
    pub status: CredentialStatus,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A credential record with its tokens decrypted.
///
/// Never serialized; the `Debug` output redacts both tokens.
#[derive(Clone, PartialEq)]
pub struct DecryptedCredential {
    pub id: String,
    pub owner_user_id: String,
    pub organization_id: Option<String>,
    pub platform: String,
    pub external_username: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub metadata: TokenMetadata,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub status: CredentialStatus,
}

impl std::fmt::Debug for DecryptedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedCredential")
            .field("id", &self.id)
            .field("owner_user_id", &self.owner_user_id)
            .field("organization_id", &self.organization_id)
            .field("platform", &self.platform)
            .field("external_username", &self.external_username)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("metadata", &self.metadata)
            .field("status", &self.status)
            .finish()
    }
}

/// Input to [`CredentialLifecycleManager::store_token`].
#[derive(Clone, Default)]
pub struct StoreTokenRequest {
    pub owner_user_id: String,
    pub organization_id: Option<String>,
    pub platform: String,
    pub username: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime of the access token; the policy's max age when absent
    pub expires_in_seconds: Option<i64>,
    pub scopes: Vec<String>,
}

/// Outcome of a rotation attempt.
///
/// `requires_reauth` is an expected business outcome (no refresh token),
/// not a fault.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub requires_reauth: bool,
}

impl RotationResult {
    pub fn rotated(new_expires_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            new_expires_at: Some(new_expires_at),
            error: None,
            requires_reauth: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            new_expires_at: None,
            error: Some(error.into()),
            requires_reauth: false,
        }
    }

    pub fn reauth_required(error: impl Into<String>) -> Self {
        Self {
            success: false,
            new_expires_at: None,
            error: Some(error.into()),
            requires_reauth: true,
        }
    }
}

/// Composite health report for one credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenHealth {
    pub is_valid: bool,
    pub is_expired: bool,
    pub needs_rotation: bool,
    pub days_until_expiry: i64,
    pub last_rotated_at: Option<DateTime<Utc>>,
}

impl TokenHealth {
    /// Report for a credential that is absent, unreadable or revoked.
    pub fn unusable(last_rotated_at: Option<DateTime<Utc>>) -> Self {
        Self {
            is_valid: false,
            is_expired: true,
            needs_rotation: true,
            days_until_expiry: 0,
            last_rotated_at,
        }
    }
}

/// Errors surfaced by the lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("credential '{0}' not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("corrupted credential metadata: {0}")]
    CorruptedMetadata(String),
}
