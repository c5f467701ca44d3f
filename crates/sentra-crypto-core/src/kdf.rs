//! PBKDF2-HMAC-SHA256 key derivation.
//!
//! This module provides:
//! - [`derive`] — derive a 256-bit key from a password + salt
//! - [`Pbkdf2Params`] — serializable parameter record (stored alongside hashes)
//!
//! The iteration floor is 100,000. Lower counts are rejected rather than
//! silently accepted — stored records always carry the count they were
//! produced with, so verification never guesses.

use crate::error::CryptoError;
use crate::memory::SecretBytes;
use ring::pbkdf2;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use zeroize::Zeroize;

/// Output length of the KDF in bytes (256 bits).
pub const OUTPUT_LEN: usize = 32;

/// Minimum salt length in bytes.
pub const MIN_SALT_LEN: usize = 16;

/// Minimum PBKDF2 iteration count.
pub const MIN_ITERATIONS: u32 = 100_000;

/// Default PBKDF2 iteration count for new derivations.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// PBKDF2 parameter record — persisted next to every derived hash so the
/// derivation is reproducible after iteration-count upgrades.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pbkdf2Params {
    /// Iteration count (time cost).
    pub iterations: u32,
}

impl Default for Pbkdf2Params {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

// ---------------------------------------------------------------------------
// Core KDF
// ---------------------------------------------------------------------------

/// Derive a 256-bit key from a password and salt using PBKDF2-HMAC-SHA256.
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` if:
/// - The salt is shorter than 16 bytes
/// - The iteration count is below 100,000
pub fn derive(
    password: &[u8],
    salt: &[u8],
    params: &Pbkdf2Params,
) -> Result<SecretBytes<OUTPUT_LEN>, CryptoError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "salt too short: {} bytes (minimum {MIN_SALT_LEN})",
            salt.len()
        )));
    }
    if params.iterations < MIN_ITERATIONS {
        return Err(CryptoError::KeyDerivation(format!(
            "iteration count too low: {} (minimum {MIN_ITERATIONS})",
            params.iterations
        )));
    }

    // MIN_ITERATIONS guard above guarantees non-zero.
    let iterations = NonZeroU32::new(params.iterations)
        .ok_or_else(|| CryptoError::KeyDerivation("iteration count is zero".into()))?;

    let mut output = [0u8; OUTPUT_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password,
        &mut output,
    );

    let result = SecretBytes::new(output);
    output.zeroize();
    Ok(result)
}

/// Verify a password against a previously derived key in constant time.
///
/// Recomputes the derivation with the stored salt/params and compares via
/// `ring::pbkdf2::verify`, which is constant-time by construction.
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` on salt/iteration validation failure
/// (same rules as [`derive`]). A wrong password is `Ok(false)`, not an error.
pub fn verify(
    password: &[u8],
    salt: &[u8],
    params: &Pbkdf2Params,
    expected: &[u8],
) -> Result<bool, CryptoError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "salt too short: {} bytes (minimum {MIN_SALT_LEN})",
            salt.len()
        )));
    }
    if params.iterations < MIN_ITERATIONS {
        return Err(CryptoError::KeyDerivation(format!(
            "iteration count too low: {} (minimum {MIN_ITERATIONS})",
            params.iterations
        )));
    }

    let iterations = NonZeroU32::new(params.iterations)
        .ok_or_else(|| CryptoError::KeyDerivation("iteration count is zero".into()))?;

    Ok(pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password,
        expected,
    )
    .is_ok())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SALT: &[u8; 16] = b"0123456789abcdef";

    const TEST_PARAMS: Pbkdf2Params = Pbkdf2Params {
        iterations: MIN_ITERATIONS,
    };

    #[test]
    fn derive_produces_32_byte_output() {
        let key = derive(b"password", TEST_SALT, &TEST_PARAMS).expect("derive should succeed");
        assert_eq!(key.expose().len(), 32);
    }

    #[test]
    fn derive_is_deterministic() {
        let a = derive(b"password", TEST_SALT, &TEST_PARAMS).expect("derive should succeed");
        let b = derive(b"password", TEST_SALT, &TEST_PARAMS).expect("derive should succeed");
        assert_eq!(a.expose(), b.expose());
    }

    #[test]
    fn derive_different_salts_produce_different_keys() {
        let a = derive(b"password", b"salt_aaaaaaaaaaaaa", &TEST_PARAMS)
            .expect("derive should succeed");
        let b = derive(b"password", b"salt_bbbbbbbbbbbbb", &TEST_PARAMS)
            .expect("derive should succeed");
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn derive_different_passwords_produce_different_keys() {
        let a = derive(b"password_a", TEST_SALT, &TEST_PARAMS).expect("derive should succeed");
        let b = derive(b"password_b", TEST_SALT, &TEST_PARAMS).expect("derive should succeed");
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn derive_rejects_short_salt() {
        let err = derive(b"password", b"short", &TEST_PARAMS)
            .expect_err("derive should reject short salt");
        assert!(format!("{err}").contains("salt too short"));
    }

    #[test]
    fn derive_rejects_low_iteration_count() {
        let params = Pbkdf2Params { iterations: 1_000 };
        let err = derive(b"password", TEST_SALT, &params)
            .expect_err("derive should reject low iterations");
        assert!(format!("{err}").contains("iteration count too low"));
    }

    #[test]
    fn verify_accepts_correct_password() {
        let key = derive(b"correct horse", TEST_SALT, &TEST_PARAMS).expect("derive");
        let ok = verify(b"correct horse", TEST_SALT, &TEST_PARAMS, key.expose()).expect("verify");
        assert!(ok);
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let key = derive(b"correct horse", TEST_SALT, &TEST_PARAMS).expect("derive");
        let ok = verify(b"battery staple", TEST_SALT, &TEST_PARAMS, key.expose()).expect("verify");
        assert!(!ok);
    }

    #[test]
    fn verify_rejects_wrong_salt() {
        let key = derive(b"password", TEST_SALT, &TEST_PARAMS).expect("derive");
        let ok = verify(b"password", b"fedcba9876543210", &TEST_PARAMS, key.expose())
            .expect("verify");
        assert!(!ok);
    }

    #[test]
    fn params_serde_roundtrip() {
        let params = Pbkdf2Params {
            iterations: 150_000,
        };
        let json = serde_json::to_string(&params).expect("serialize should succeed");
        let deserialized: Pbkdf2Params =
            serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(params, deserialized);
    }

    #[test]
    fn default_params_meet_floor() {
        let params = Pbkdf2Params::default();
        assert!(params.iterations >= MIN_ITERATIONS);
    }
}
