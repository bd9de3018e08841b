//! Platform token refresh collaborator.
//!
//! The lifecycle manager only needs one thing from a platform: exchange a
//! refresh token for a fresh token pair. [`PlatformRefresher`] is that seam;
//! [`HttpTokenRefresher`] implements it with the standard OAuth 2.0
//! `refresh_token` grant.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod http;

pub use http::HttpTokenRefresher;

/// Token pair returned by a successful platform refresh.
#[derive(Clone, PartialEq)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// `None` when the platform did not issue a new refresh token
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for RefreshedTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Exchanges a refresh token for a new token pair on one platform.
///
/// Implementations should be opaque about platform details and return an
/// error for any failure (network, rejection, malformed response). The
/// caller bounds each call with a timeout and never retries.
///
/// # Example
/// ```no_run
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use credvault::refresh::{PlatformRefresher, RefreshedTokens};
///
/// struct StaticRefresher;
///
/// #[async_trait]
/// impl PlatformRefresher for StaticRefresher {
///     async fn refresh(&self, _platform: &str, _refresh_token: &str) -> Result<RefreshedTokens> {
///         Ok(RefreshedTokens {
///             access_token: "fresh".to_string(),
///             refresh_token: None,
///             expires_at: None,
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait PlatformRefresher: Send + Sync {
    async fn refresh(&self, platform: &str, refresh_token: &str) -> Result<RefreshedTokens>;
}
