//! OAuth 2.0 `refresh_token` grant over HTTP (RFC 6749 section 6).

use super::{PlatformRefresher, RefreshedTokens};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Token endpoints for platforms that accept a plain refresh grant.
const DEFAULT_TOKEN_URLS: &[(&str, &str)] = &[
    ("linkedin", "https://www.linkedin.com/oauth/v2/accessToken"),
    ("pinterest", "https://api.pinterest.com/v5/oauth/token"),
    ("twitter", "https://api.twitter.com/2/oauth2/token"),
    ("youtube", "https://oauth2.googleapis.com/token"),
];

#[derive(Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Refreshes tokens by POSTing to each platform's token endpoint.
///
/// Client credentials are included when `CREDVAULT_OAUTH_{PLATFORM}_CLIENT_ID`
/// / `CREDVAULT_OAUTH_{PLATFORM}_CLIENT_SECRET` are set in the environment.
pub struct HttpTokenRefresher {
    http_client: reqwest::Client,
    token_urls: HashMap<String, String>,
}

impl HttpTokenRefresher {
    /// `overrides` replace or extend the built-in platform → token URL table.
    pub fn new(timeout: Duration, overrides: &HashMap<String, String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let mut token_urls: HashMap<String, String> = DEFAULT_TOKEN_URLS
            .iter()
            .map(|(platform, url)| (platform.to_string(), url.to_string()))
            .collect();
        for (platform, url) in overrides {
            token_urls.insert(platform.to_lowercase(), url.clone());
        }

        Ok(Self {
            http_client,
            token_urls,
        })
    }

    pub fn token_url(&self, platform: &str) -> Option<&str> {
        self.token_urls
            .get(&platform.to_lowercase())
            .map(String::as_str)
    }
}

#[async_trait]
impl PlatformRefresher for HttpTokenRefresher {
    async fn refresh(&self, platform: &str, refresh_token: &str) -> Result<RefreshedTokens> {
        let token_url = self
            .token_url(platform)
            .ok_or_else(|| anyhow!("No token endpoint configured for platform '{}'", platform))?;
        let env_prefix = platform.to_uppercase();

        let mut form: HashMap<&str, String> = HashMap::new();
        form.insert("grant_type", "refresh_token".to_string());
        form.insert("refresh_token", refresh_token.to_string());

        if let Ok(client_id) = std::env::var(format!("CREDVAULT_OAUTH_{}_CLIENT_ID", env_prefix)) {
            form.insert("client_id", client_id);
        }
        if let Ok(client_secret) =
            std::env::var(format!("CREDVAULT_OAUTH_{}_CLIENT_SECRET", env_prefix))
        {
            form.insert("client_secret", client_secret);
        }

        info!(platform = %platform, "Refreshing OAuth token");

        let response = self
            .http_client
            .post(token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .context("Failed to send token refresh request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            warn!(platform = %platform, status = %status, "Platform rejected token refresh");
            anyhow::bail!("Token refresh failed with status {}: {}", status, body);
        }

        let token_response: TokenRefreshResponse = response
            .json()
            .await
            .context("Failed to parse token refresh response")?;

        if token_response.access_token.is_empty() {
            anyhow::bail!("Token refresh response contained an empty access_token");
        }

        let expires_at = match token_response.expires_in.filter(|secs| *secs > 0) {
            Some(secs) => {
                let expires_at = chrono::Duration::try_seconds(secs)
                    .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        anyhow!("Token refresh response has out-of-range expires_in {}", secs)
                    })?;
                Some(expires_at)
            }
            None => None,
        };

        Ok(RefreshedTokens {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token.filter(|t| !t.is_empty()),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refresher_for(server: &mockito::ServerGuard) -> HttpTokenRefresher {
        let mut overrides = HashMap::new();
        overrides.insert("MockPlatform".to_string(), format!("{}/token", server.url()));
        HttpTokenRefresher::new(Duration::from_secs(5), &overrides).unwrap()
    }

    #[test]
    fn test_default_and_override_urls() {
        let mut overrides = HashMap::new();
        overrides.insert("instagram".to_string(), "https://example.com/ig".to_string());
        overrides.insert("linkedin".to_string(), "https://example.com/li".to_string());
        let refresher = HttpTokenRefresher::new(Duration::from_secs(1), &overrides).unwrap();

        assert_eq!(refresher.token_url("youtube"), Some("https://oauth2.googleapis.com/token"));
        assert_eq!(refresher.token_url("Instagram"), Some("https://example.com/ig"));
        assert_eq!(refresher.token_url("linkedin"), Some("https://example.com/li"));
        assert_eq!(refresher.token_url("myspace"), None);
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_header("accept", "application/json")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("refresh_token".into(), "my_refresh".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new_token","refresh_token":"new_refresh","expires_in":3600}"#)
            .create_async()
            .await;

        let before = Utc::now();
        let tokens = refresher_for(&server)
            .refresh("mockplatform", "my_refresh")
            .await
            .expect("refresh should succeed");

        assert_eq!(tokens.access_token, "new_token");
        assert_eq!(tokens.refresh_token.as_deref(), Some("new_refresh"));
        let expires_at = tokens.expires_at.unwrap();
        assert!(expires_at >= before + chrono::Duration::seconds(3600));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_without_rotation_or_expiry() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new_token"}"#)
            .create_async()
            .await;

        let tokens = refresher_for(&server)
            .refresh("mockplatform", "my_refresh")
            .await
            .unwrap();

        assert!(tokens.refresh_token.is_none());
        assert!(tokens.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_refresh_out_of_range_expiry_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new_token","expires_in":9223372036854775807}"#)
            .create_async()
            .await;

        let err = refresher_for(&server)
            .refresh("mockplatform", "my_refresh")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("out-of-range expires_in"));
    }

    #[tokio::test]
    async fn test_refresh_http_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let err = refresher_for(&server)
            .refresh("mockplatform", "expired_refresh")
            .await
            .unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("400"));
        assert!(message.contains("invalid_grant"));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_malformed_response() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let result = refresher_for(&server).refresh("mockplatform", "r").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unknown_platform() {
        let refresher = HttpTokenRefresher::new(Duration::from_secs(1), &HashMap::new()).unwrap();
        let err = refresher.refresh("myspace", "r").await.unwrap_err();
        assert!(err.to_string().contains("myspace"));
    }

    #[test]
    fn test_refreshed_tokens_debug_is_redacted() {
        let tokens = RefreshedTokens {
            access_token: "secret-access".to_string(),
            refresh_token: Some("secret-refresh".to_string()),
            expires_at: None,
        };
        let rendered = format!("{:?}", tokens);
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
    }
}
