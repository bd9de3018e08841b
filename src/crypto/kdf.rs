//! Argon2id derivation of the symmetric token key from the master secret.

use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroizing;

use super::encryption::KEY_SIZE;
use super::CryptoError;

/// Cost parameters for Argon2id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// OWASP-recommended Argon2id baseline (19 MiB, t=2, p=1).
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests; never use outside of them.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Derives a 32-byte key. Deterministic for a given secret, salt and params.
pub fn derive_key(
    master_secret: &[u8],
    salt: &[u8],
    params: KdfParams,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(master_secret, salt, &mut output[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    Ok(output)
}
