//! Expiry-driven rotation policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::TokenMetadata;

/// Longest token lifetime the policy accepts (ten years).
pub(crate) const MAX_AGE_LIMIT_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// When a credential should be exchanged for a fresh token pair.
///
/// Shared by every record; loaded from the `[rotation]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPolicy {
    /// Lifetime assumed for tokens stored or refreshed without an expiry
    #[serde(default = "default_max_age_seconds")]
    pub max_age_seconds: u64,

    /// Rotate once this percentage of the lifetime remains (0-100)
    #[serde(default = "default_rotation_threshold_percent")]
    pub rotation_threshold_percent: u8,

    #[serde(default = "default_auto_rotate_enabled")]
    pub auto_rotate_enabled: bool,
}

fn default_max_age_seconds() -> u64 {
    60 * 24 * 60 * 60 // 60 days
}

fn default_rotation_threshold_percent() -> u8 {
    20
}

fn default_auto_rotate_enabled() -> bool {
    true
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_age_seconds: default_max_age_seconds(),
            rotation_threshold_percent: default_rotation_threshold_percent(),
            auto_rotate_enabled: default_auto_rotate_enabled(),
        }
    }
}

impl RotationPolicy {
    pub fn max_age(&self) -> Duration {
        Duration::seconds(self.max_age_seconds.min(MAX_AGE_LIMIT_SECONDS) as i64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rotation_threshold_percent > 100 {
            return Err(format!(
                "rotation_threshold_percent must be between 0 and 100, got {}",
                self.rotation_threshold_percent
            ));
        }
        if self.max_age_seconds == 0 || self.max_age_seconds > MAX_AGE_LIMIT_SECONDS {
            return Err(format!(
                "max_age_seconds must be between 1 and {}, got {}",
                MAX_AGE_LIMIT_SECONDS, self.max_age_seconds
            ));
        }
        Ok(())
    }

    /// True once the token is expired or within the threshold share of its
    /// lifetime. Always false when auto-rotation is disabled.
    pub fn needs_rotation(&self, metadata: &TokenMetadata, now: DateTime<Utc>) -> bool {
        if !self.auto_rotate_enabled {
            return false;
        }
        if metadata.is_expired_at(now) {
            return true;
        }

        let lifetime_ms = i128::from(metadata.lifetime().num_milliseconds());
        let remaining_ms = i128::from((metadata.expires_at - now).num_milliseconds());
        let threshold_ms = lifetime_ms * i128::from(self.rotation_threshold_percent) / 100;

        remaining_ms <= threshold_ms
    }
}
