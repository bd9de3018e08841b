//! Unit tests for the token encryption engine

use super::*;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use std::sync::Arc;

const MASTER: &str = "0123456789abcdef0123456789abcdef";
const SALT: &str = "credvault-test-salt";

fn key(id: &str, master: &str) -> KeyMaterial {
    KeyMaterial::configured(id, master, SALT).expect("valid key material")
}

fn engine() -> CryptoEngine {
    CryptoEngine::new(key("primary", MASTER), KdfParams::insecure_fast())
}

fn metadata() -> TokenMetadata {
    TokenMetadata::issue(
        "instagram",
        ["instagram_basic", "instagram_content_publish"],
        Utc::now(),
        Duration::days(60),
    )
}

/// Flips one bit in a base64-encoded field.
fn flip_bit(field: &str) -> String {
    let mut bytes = BASE64.decode(field).unwrap();
    bytes[0] ^= 0x01;
    BASE64.encode(bytes)
}

#[test]
fn test_roundtrip() {
    let engine = engine();
    let meta = metadata();

    for plaintext in ["IGQVJ-access-token", "", "ünïcødé-token-✓"] {
        let blob = engine.encrypt(plaintext, &meta).unwrap();
        assert_eq!(engine.decrypt(&blob, &meta).unwrap(), plaintext);
    }
}

#[test]
fn test_blob_fields() {
    let engine = engine();
    let blob = engine.encrypt("token", &metadata()).unwrap();

    assert_eq!(blob.schema_version, SCHEMA_VERSION);
    assert_eq!(blob.key_id, "primary");
    assert_eq!(BASE64.decode(&blob.iv).unwrap().len(), 12);
    assert_eq!(BASE64.decode(&blob.auth_tag).unwrap().len(), 16);
    assert!(!blob.ciphertext.contains("token"));
}

#[test]
fn test_reencryption_uses_fresh_iv() {
    let engine = engine();
    let meta = metadata();

    let first = engine.encrypt("same", &meta).unwrap();
    let second = engine.encrypt("same", &meta).unwrap();
    assert_ne!(first.iv, second.iv);
    assert_ne!(first, second);
}

#[test]
fn test_tampered_ciphertext_iv_and_tag_fail() {
    let engine = engine();
    let meta = metadata();
    let blob = engine.encrypt("refresh-token-value", &meta).unwrap();

    let mut bad = blob.clone();
    bad.ciphertext = flip_bit(&blob.ciphertext);
    assert!(matches!(engine.decrypt(&bad, &meta), Err(CryptoError::Decryption(_))));

    let mut bad = blob.clone();
    bad.iv = flip_bit(&blob.iv);
    assert!(matches!(engine.decrypt(&bad, &meta), Err(CryptoError::Decryption(_))));

    let mut bad = blob.clone();
    bad.auth_tag = flip_bit(&blob.auth_tag);
    assert!(matches!(engine.decrypt(&bad, &meta), Err(CryptoError::Decryption(_))));
}

#[test]
fn test_metadata_mismatch_fails() {
    let engine = engine();
    let meta = metadata();
    let blob = engine.encrypt("token", &meta).unwrap();

    let mut other = meta.clone();
    other.rotation_count += 1;
    assert!(matches!(engine.decrypt(&blob, &other), Err(CryptoError::Decryption(_))));

    let mut other = meta.clone();
    other.platform = "facebook".to_string();
    assert!(engine.decrypt(&blob, &other).is_err());

    let mut other = meta.clone();
    other.scopes.insert("ads_management".to_string());
    assert!(engine.decrypt(&blob, &other).is_err());

    let mut other = meta;
    other.expires_at += Duration::seconds(1);
    assert!(engine.decrypt(&blob, &other).is_err());
}

#[test]
fn test_version_mismatch_rejected_before_decryption() {
    let engine = engine();
    let meta = metadata();
    let mut blob = engine.encrypt("token", &meta).unwrap();
    blob.schema_version = "v2".to_string();

    assert_eq!(
        engine.decrypt(&blob, &meta),
        Err(CryptoError::UnsupportedVersion {
            found: "v2".to_string(),
            expected: SCHEMA_VERSION.to_string(),
        })
    );

    // Garbage ciphertext still reports the version problem first
    blob.ciphertext = "!!!".to_string();
    assert!(matches!(
        engine.decrypt(&blob, &meta),
        Err(CryptoError::UnsupportedVersion { .. })
    ));
}

#[test]
fn test_key_id_is_authenticated() {
    let engine = engine()
        .with_retired_key(key("legacy", "fedcba9876543210fedcba9876543210"))
        .unwrap();
    let meta = metadata();
    let mut blob = engine.encrypt("token", &meta).unwrap();

    blob.key_id = "legacy".to_string();
    assert!(matches!(engine.decrypt(&blob, &meta), Err(CryptoError::Decryption(_))));

    blob.key_id = "missing".to_string();
    assert_eq!(
        engine.decrypt(&blob, &meta),
        Err(CryptoError::UnknownKey("missing".to_string()))
    );
}

#[test]
fn test_retired_key_still_decrypts() {
    let meta = metadata();
    let old_engine = CryptoEngine::new(key("2025-q4", MASTER), KdfParams::insecure_fast());
    let old_blob = old_engine.encrypt("written-before-rotation", &meta).unwrap();

    let new_engine = CryptoEngine::new(
        key("2026-q1", "another-master-secret-of-32-bytes!"),
        KdfParams::insecure_fast(),
    )
    .with_retired_key(key("2025-q4", MASTER))
    .unwrap();

    assert_eq!(new_engine.decrypt(&old_blob, &meta).unwrap(), "written-before-rotation");

    let new_blob = new_engine.encrypt("fresh", &meta).unwrap();
    assert_eq!(new_blob.key_id, "2026-q1");
}

#[test]
fn test_duplicate_key_id_rejected() {
    let result = engine().with_retired_key(key("primary", MASTER));
    assert!(matches!(result, Err(CryptoError::InvalidKeyMaterial(_))));
}

#[test]
fn test_engines_with_same_material_interoperate() {
    let meta = metadata();
    let blob = engine().encrypt("token", &meta).unwrap();
    assert_eq!(engine().decrypt(&blob, &meta).unwrap(), "token");
}

#[test]
fn test_derive_key_is_cached() {
    let engine = engine();
    let first = engine.derive_key().unwrap() as *const [u8; KEY_SIZE];
    let second = engine.derive_key().unwrap() as *const [u8; KEY_SIZE];
    assert_eq!(first, second);
}

#[test]
fn test_concurrent_first_derivation() {
    let engine = Arc::new(engine());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || *engine.derive_key().unwrap())
        })
        .collect();

    let keys: Vec<[u8; KEY_SIZE]> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(keys.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_invalid_kdf_params_surface_as_encryption_error() {
    let params = KdfParams {
        memory_kib: 1,
        iterations: 0,
        parallelism: 1,
    };
    let engine = CryptoEngine::new(key("primary", MASTER), params);
    assert!(matches!(
        engine.encrypt("token", &metadata()),
        Err(CryptoError::Encryption(_))
    ));
}

#[test]
fn test_configured_key_validation() {
    assert!(KeyMaterial::configured("primary", "short", SALT).is_err());
    assert!(KeyMaterial::configured("primary", MASTER, "salt").is_err());
    assert!(KeyMaterial::configured("", MASTER, SALT).is_err());
    assert!(KeyMaterial::configured("primary", MASTER, SALT).is_ok());
}

#[test]
fn test_key_material_debug_is_redacted() {
    let rendered = format!("{:?}", key("primary", MASTER));
    assert!(rendered.contains("REDACTED"));
    assert!(!rendered.contains(MASTER));
}

#[test]
fn test_health_status_configured() {
    let engine = engine()
        .with_retired_key(key("legacy", "fedcba9876543210fedcba9876543210"))
        .unwrap();
    let health = engine.health_status();

    assert_eq!(health.status, "healthy");
    assert_eq!(health.version, SCHEMA_VERSION);
    assert_eq!(health.key_id, "primary");
    assert_eq!(health.algorithm, "aes-256-gcm");
    assert!(health.key_configured);
    assert_eq!(health.key_source, KeySource::Configured);
    assert_eq!(health.retired_key_ids, vec!["legacy".to_string()]);
}

#[test]
fn test_health_status_ephemeral_is_distinguishable() {
    let engine = CryptoEngine::new(KeyMaterial::ephemeral("dev"), KdfParams::insecure_fast());
    let health = engine.health_status();

    assert_eq!(health.status, "degraded");
    assert!(!health.key_configured);
    assert_eq!(health.key_source, KeySource::Ephemeral);

    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["keyConfigured"], false);
    assert_eq!(json["keySource"], "ephemeral");

    // Still fully functional for local use
    let meta = metadata();
    let blob = engine.encrypt("dev-token", &meta).unwrap();
    assert_eq!(engine.decrypt(&blob, &meta).unwrap(), "dev-token");
}

#[test]
fn test_secure_compare() {
    assert!(secure_compare("abc", "abc"));
    assert!(!secure_compare("abc", "abd"));
    assert!(!secure_compare("ab", "abc"));
    assert!(!secure_compare("abc", "ab"));
    assert!(secure_compare("", ""));
    assert!(!secure_compare("", "a"));
}
