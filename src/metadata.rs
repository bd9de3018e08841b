//! Non-secret token attributes bound into every ciphertext as AAD.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Upper bound on `rotation_count`; anything above is treated as corruption.
pub const MAX_ROTATION_COUNT: u32 = 1000;

/// Tolerated drift between the clock that issued a token and ours.
const MAX_CLOCK_SKEW_SECONDS: i64 = 60;

/// Attributes of a credential that travel in plaintext next to the
/// ciphertext and are authenticated by the AEAD tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetadata {
    pub platform: String,
    pub scopes: BTreeSet<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_rotated_at: DateTime<Utc>,
    pub rotation_count: u32,
}

/// Metadata failed a sanity check.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetadataError {
    #[error("issuedAt {0} is in the future")]
    IssuedInFuture(DateTime<Utc>),
    #[error("expiresAt precedes issuedAt")]
    ExpiresBeforeIssued,
    #[error("rotationCount {0} exceeds {max}", max = MAX_ROTATION_COUNT)]
    RotationCountOutOfRange(u32),
}

impl TokenMetadata {
    /// Metadata for a freshly issued token.
    pub fn issue<I, S>(platform: &str, scopes: I, now: DateTime<Utc>, lifetime: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            platform: platform.to_string(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            issued_at: now,
            expires_at: now + lifetime,
            last_rotated_at: now,
            rotation_count: 0,
        }
    }

    /// Metadata for the token pair that replaces this one after a refresh.
    ///
    /// The new pair is issued at `now`, so the rotation threshold is measured
    /// against the new lifetime rather than the original one.
    pub fn rotated(&self, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            platform: self.platform.clone(),
            scopes: self.scopes.clone(),
            issued_at: now,
            expires_at,
            last_rotated_at: now,
            rotation_count: self.rotation_count.saturating_add(1),
        }
    }

    /// Total lifetime of the current token.
    pub fn lifetime(&self) -> Duration {
        self.expires_at - self.issued_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Checks the invariants a well-formed record always satisfies.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), MetadataError> {
        if self.issued_at > now + Duration::seconds(MAX_CLOCK_SKEW_SECONDS) {
            return Err(MetadataError::IssuedInFuture(self.issued_at));
        }
        if self.expires_at < self.issued_at {
            return Err(MetadataError::ExpiresBeforeIssued);
        }
        if self.rotation_count > MAX_ROTATION_COUNT {
            return Err(MetadataError::RotationCountOutOfRange(self.rotation_count));
        }
        Ok(())
    }

    /// Canonical byte encoding used as additional authenticated data.
    ///
    /// Every field is length-prefixed so no choice of platform or scope names
    /// can make two different metadata values encode identically.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        push_field(&mut out, &self.platform);
        push_field(&mut out, &self.scopes.len().to_string());
        for scope in &self.scopes {
            push_field(&mut out, scope);
        }
        push_field(&mut out, &canonical_time(&self.issued_at));
        push_field(&mut out, &canonical_time(&self.expires_at));
        push_field(&mut out, &canonical_time(&self.last_rotated_at));
        push_field(&mut out, &self.rotation_count.to_string());
        out
    }
}

fn canonical_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn push_field(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(value.as_bytes());
    out.push(b';');
}
