use axum::http::HeaderMap;
use serde::Deserialize;

use crate::crypto::secure_compare;


/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
/// Returns the token string if present and valid.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let (scheme, token) = header_value
        .split_once(' ')
        .ok_or(TokenError::InvalidFormat)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum TokenError {
    #[error("Authorization token not provided")]
    Missing,
    /// Not "Bearer <token>"
    #[error("Invalid authorization token format")]
    InvalidFormat,
    #[error("Authorization token is empty")]
    Empty,
}

/// One API caller from the `[[auth.callers]]` config table.
#[derive(Clone, Deserialize)]
pub struct CallerConfig {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
}

impl std::fmt::Debug for CallerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerConfig")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("organization_id", &self.organization_id)
            .finish()
    }
}

/// Identity a bearer token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub organization_id: Option<String>,
}

/// Maps bearer tokens to callers.
///
/// Every configured token is compared in constant time and the scan never
/// stops early, so response timing does not reveal which entry matched.
#[derive(Debug, Clone, Default)]
pub struct CallerRegistry {
    callers: Vec<CallerConfig>,
}

impl CallerRegistry {
    pub fn new(callers: Vec<CallerConfig>) -> Self {
        Self { callers }
    }

    pub fn len(&self) -> usize {
        self.callers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }

    pub fn resolve(&self, token: &str) -> Option<Caller> {
        let mut matched = None;
        for caller in &self.callers {
            if secure_compare(token, &caller.token) && matched.is_none() {
                matched = Some(caller);
            }
        }

        matched.map(|c| Caller {
            user_id: c.user_id.clone(),
            organization_id: c.organization_id.clone(),
        })
    }

    /// Extracts the bearer token from `headers` and resolves it.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Caller, AuthError> {
        let token = extract_bearer_token(headers)?;
        self.resolve(&token).ok_or(AuthError::UnknownToken)
    }
}

/// Authentication failures. All map to 401.
#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("Unknown bearer token")]
    UnknownToken,
}
