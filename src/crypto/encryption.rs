//! AES-256-GCM primitives for credential tokens.
//!
//! Each token is encrypted separately with a unique nonce, and the tag is kept
//! detached from the ciphertext so the envelope can carry it as its own field.

use aes_gcm::{
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::CryptoError;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Output of a single detached encryption, every part base64-encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Sealed {
    pub ciphertext: String,
    pub nonce: String,
    pub tag: String,
}

/// Encrypts plaintext using AES-256-GCM with a random nonce.
///
/// # Arguments
/// * `plaintext` - Data to encrypt (e.g., access token)
/// * `aad` - Additional authenticated data bound into the tag
/// * `key` - 32-byte encryption key
///
/// # Security
/// - Uses a cryptographically secure random nonce (never reuse)
/// - The nonce is passed explicitly to the cipher; nothing is derived from the key
pub fn encrypt(plaintext: &str, aad: &[u8], key: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = cipher_for(key).map_err(CryptoError::Encryption)?;

    // Generate random nonce (never reuse!)
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut buffer = plaintext.as_bytes().to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, aad, &mut buffer)
        .map_err(|_| CryptoError::Encryption("cipher rejected parameters".to_string()))?;

    Ok(Sealed {
        ciphertext: BASE64.encode(&buffer),
        nonce: BASE64.encode(nonce),
        tag: BASE64.encode(tag),
    })
}

/// Decrypts a detached AES-256-GCM ciphertext.
///
/// Fails if the key, nonce, tag, ciphertext or AAD differ in any way from what
/// was used during encryption.
pub fn decrypt(
    ciphertext: &str,
    nonce: &str,
    tag: &str,
    aad: &[u8],
    key: &[u8],
) -> Result<String, CryptoError> {
    let cipher = cipher_for(key).map_err(CryptoError::Decryption)?;

    let mut buffer = decode(ciphertext, "ciphertext")?;
    let nonce_bytes = decode(nonce, "iv")?;
    let tag_bytes = decode(tag, "auth tag")?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::Decryption(format!(
            "invalid iv size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }
    if tag_bytes.len() != TAG_SIZE {
        return Err(CryptoError::Decryption(format!(
            "invalid auth tag size: expected {}, got {}",
            TAG_SIZE,
            tag_bytes.len()
        )));
    }

    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce_bytes),
            aad,
            &mut buffer,
            Tag::from_slice(&tag_bytes),
        )
        .map_err(|_| {
            CryptoError::Decryption("authentication failed (wrong key, tampered data or metadata)".to_string())
        })?;

    String::from_utf8(buffer)
        .map_err(|_| CryptoError::Decryption("decrypted data is not valid UTF-8".to_string()))
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, String> {
    if key.len() != KEY_SIZE {
        return Err(format!("encryption key must be {} bytes", KEY_SIZE));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| format!("failed to create cipher: {}", e))
}

fn decode(value: &str, field: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64
        .decode(value)
        .map_err(|_| CryptoError::Decryption(format!("{} is not valid base64", field)))
}
