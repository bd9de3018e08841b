// Integration tests for GET/POST /api/tokens

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use credvault::api::{create_router, TokenAppState};
use credvault::auth::{CallerConfig, CallerRegistry};
use credvault::credentials::{
    CredentialLifecycleManager, RotationPolicy, SqliteCredentialStore, Timeouts,
};
use credvault::crypto::{CryptoEngine, KdfParams, KeyMaterial};
use credvault::refresh::{PlatformRefresher, RefreshedTokens};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const ALICE: &str = "token-alice";
const BOB: &str = "token-bob";

/// Refresher that either succeeds with a fixed pair or fails.
struct StubRefresher {
    fail: bool,
}

#[async_trait]
impl PlatformRefresher for StubRefresher {
    async fn refresh(&self, _platform: &str, _refresh_token: &str) -> anyhow::Result<RefreshedTokens> {
        if self.fail {
            anyhow::bail!("Token refresh failed with status 400 Bad Request: invalid_grant");
        }
        Ok(RefreshedTokens {
            access_token: "rotated-access".to_string(),
            refresh_token: Some("rotated-refresh".to_string()),
            expires_at: Some(Utc::now() + chrono::Duration::days(60)),
        })
    }
}

fn create_test_app_with(fail_refresh: bool, policy: RotationPolicy) -> Router {
    let key = KeyMaterial::configured(
        "primary",
        "0123456789abcdef0123456789abcdef",
        "integration-test-salt",
    )
    .unwrap();
    let crypto = Arc::new(CryptoEngine::new(key, KdfParams::insecure_fast()));
    let store = Arc::new(SqliteCredentialStore::new(":memory:").unwrap());

    let manager = Arc::new(CredentialLifecycleManager::new(
        Arc::clone(&crypto),
        store,
        Arc::new(StubRefresher { fail: fail_refresh }),
        policy,
        Timeouts::default(),
    ));

    let callers = CallerRegistry::new(vec![
        CallerConfig {
            token: ALICE.to_string(),
            user_id: "alice".to_string(),
            organization_id: Some("acme".to_string()),
        },
        CallerConfig {
            token: BOB.to_string(),
            user_id: "bob".to_string(),
            organization_id: None,
        },
    ]);

    create_router(TokenAppState {
        manager,
        crypto,
        callers: Arc::new(callers),
    })
}

fn create_test_app() -> Router {
    create_test_app_with(false, RotationPolicy::default())
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn post(app: &Router, token: &str, body: Value) -> (StatusCode, Value) {
    send(
        app,
        Request::builder()
            .method("POST")
            .uri("/api/tokens")
            .header("Content-Type", "application/json")
            .header("Authorization", bearer(token))
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
    )
    .await
}

async fn get(app: &Router, token: &str, action: &str) -> (StatusCode, Value) {
    send(
        app,
        Request::builder()
            .method("GET")
            .uri(format!("/api/tokens?action={}", action))
            .header("Authorization", bearer(token))
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

async fn store_instagram(app: &Router, token: &str, refresh_token: Option<&str>) -> String {
    let (status, body) = post(
        app,
        token,
        json!({
            "action": "store",
            "platform": "instagram",
            "username": "acme.studio",
            "accessToken": "IGQVJ-access",
            "refreshToken": refresh_token,
            "expiresIn": 90 * 86400,
            "scopes": ["instagram_basic"],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "store failed: {}", body);
    body["accountId"].as_str().unwrap().to_string()
}

/// GET /health needs no credentials.
#[tokio::test]
async fn test_health_probe_is_public() {
    let app = create_test_app();
    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

/// Missing, malformed and unknown bearer tokens are rejected with 401.
#[tokio::test]
async fn test_requires_known_bearer_token() {
    let app = create_test_app();

    let (status, _) = send(
        &app,
        Request::builder()
            .uri("/api/tokens?action=health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get(&app, "not-a-caller", "health").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Auth is checked before the body is parsed
    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/tokens")
            .header("Content-Type", "application/json")
            .header("Authorization", "Basic abc")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

/// Store then validate: a 90-day instagram token is healthy.
#[tokio::test]
async fn test_store_then_validate() {
    let app = create_test_app();
    let account_id = store_instagram(&app, ALICE, Some("IGQVJ-refresh")).await;

    let (status, body) = post(
        &app,
        ALICE,
        json!({ "action": "validate", "accountId": account_id }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isValid"], true);
    assert_eq!(body["isExpired"], false);
    assert_eq!(body["needsRotation"], false);
    assert_eq!(body["daysUntilExpiry"], 90);
}

/// Store rejects missing required fields with 400.
#[tokio::test]
async fn test_store_missing_fields() {
    let app = create_test_app();

    for missing in ["platform", "username", "accessToken"] {
        let mut body = json!({
            "action": "store",
            "platform": "linkedin",
            "username": "acme",
            "accessToken": "tok",
        });
        body.as_object_mut().unwrap().remove(missing);

        let (status, response) = post(&app, ALICE, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(response["error"].as_str().unwrap().contains(missing));
    }
}

/// Malformed bodies and unknown actions are 400.
#[tokio::test]
async fn test_bad_requests() {
    let app = create_test_app();

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/tokens")
            .header("Content-Type", "application/json")
            .header("Authorization", bearer(ALICE))
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(&app, ALICE, json!({ "action": "explode" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(&app, ALICE, json!({ "action": "rotate" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&app, ALICE, "everything").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

/// GET ?action=health returns per-token entries and summary counts.
#[tokio::test]
async fn test_health_summary() {
    let app = create_test_app();
    let first = store_instagram(&app, ALICE, None).await;
    store_instagram(&app, ALICE, None).await;
    store_instagram(&app, BOB, None).await;

    let (status, body) = get(&app, ALICE, "health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["total"], 2);
    assert_eq!(body["summary"]["healthy"], 2);
    assert_eq!(body["summary"]["expired"], 0);
    assert_eq!(body["summary"]["needsRotation"], 0);

    let tokens = body["tokens"].as_array().unwrap();
    assert!(tokens.iter().any(|t| t["accountId"] == first.as_str()));
    assert_eq!(tokens[0]["status"], "connected");
    assert_eq!(tokens[0]["isValid"], true);

    // No secrets in the response
    assert!(!body.to_string().contains("IGQVJ"));
}

/// GET ?action=rotation-status lists credentials inside the threshold.
#[tokio::test]
async fn test_rotation_status() {
    let policy = RotationPolicy {
        rotation_threshold_percent: 100,
        ..RotationPolicy::default()
    };
    let app = create_test_app_with(false, policy);
    let account_id = store_instagram(&app, ALICE, Some("r")).await;

    let (status, body) = get(&app, ALICE, "rotation-status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["tokens"][0]["accountId"], account_id.as_str());

    let (_, body) = get(&app, BOB, "rotation-status").await;
    assert_eq!(body["count"], 0);
}

/// GET ?action=encryption-status reports the engine without key material.
#[tokio::test]
async fn test_encryption_status() {
    let app = create_test_app();
    let (status, body) = get(&app, ALICE, "encryption-status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["algorithm"], "aes-256-gcm");
    assert_eq!(body["keyConfigured"], true);
    assert_eq!(body["keyId"], "primary");
    assert!(!body.to_string().contains("0123456789abcdef"));
}

/// Rotation without a refresh token is a 400 with requiresReauth.
#[tokio::test]
async fn test_rotate_requires_reauth() {
    let app = create_test_app();
    let account_id = store_instagram(&app, ALICE, None).await;

    let (status, body) = post(&app, ALICE, json!({ "action": "rotate", "accountId": account_id })).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["requiresReauth"], true);
}

/// Successful rotation returns the new expiry.
#[tokio::test]
async fn test_rotate_success() {
    let app = create_test_app();
    let account_id = store_instagram(&app, ALICE, Some("IGQVJ-refresh")).await;

    let (status, body) = post(&app, ALICE, json!({ "action": "rotate", "accountId": account_id })).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["requiresReauth"], false);
    assert!(body["newExpiresAt"].is_string());
}

/// Collaborator failure is a 500 carrying the platform's error.
#[tokio::test]
async fn test_rotate_collaborator_failure() {
    let app = create_test_app_with(true, RotationPolicy::default());
    let account_id = store_instagram(&app, ALICE, Some("IGQVJ-refresh")).await;

    let (status, body) = post(&app, ALICE, json!({ "action": "rotate", "accountId": account_id })).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("invalid_grant"));

    // Record still healthy
    let (_, health) = post(&app, ALICE, json!({ "action": "validate", "accountId": account_id })).await;
    assert_eq!(health["isValid"], true);
}

/// Revoke succeeds twice and leaves the account unusable.
#[tokio::test]
async fn test_revoke_is_idempotent() {
    let app = create_test_app();
    let account_id = store_instagram(&app, ALICE, Some("IGQVJ-refresh")).await;

    for _ in 0..2 {
        let (status, body) = post(
            &app,
            ALICE,
            json!({ "action": "revoke", "accountId": account_id, "reason": "user_requested" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    let (_, health) = post(&app, ALICE, json!({ "action": "validate", "accountId": account_id })).await;
    assert_eq!(health["isValid"], false);
    assert_eq!(health["daysUntilExpiry"], 0);

    let (status, body) = post(&app, ALICE, json!({ "action": "rotate", "accountId": account_id })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["requiresReauth"], true);
}

/// Another caller's account looks exactly like a missing one.
#[tokio::test]
async fn test_foreign_account_is_not_found() {
    let app = create_test_app();
    let account_id = store_instagram(&app, ALICE, Some("IGQVJ-refresh")).await;

    for action in ["rotate", "revoke", "validate"] {
        let (status, body) = post(&app, BOB, json!({ "action": action, "accountId": account_id })).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "action {}", action);
        assert_eq!(body["error"], "Account not found");
    }

    let (status, _) = post(&app, ALICE, json!({ "action": "validate", "accountId": "missing" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Alice's credential was not touched
    let (_, health) = post(&app, ALICE, json!({ "action": "validate", "accountId": account_id })).await;
    assert_eq!(health["isValid"], true);
}
