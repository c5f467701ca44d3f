//! Password policy enforcement and salted password hashing.
//!
//! This module provides:
//! - [`validate_policy`] — hard strength rules, checked before any hashing
//! - [`hash_password`] — PBKDF2 record with a per-user 256-bit random salt
//! - [`verify_password`] — recompute with stored parameters, constant-time
//!   comparison
//!
//! The policy is deliberately strict and fails fast with the first violated
//! rule so the caller can surface a specific reason.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::kdf::{self, Pbkdf2Params};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Minimum password length in characters.
pub const MIN_PASSWORD_LEN: usize = 12;

/// Per-user salt length in bytes (256 bits).
pub const SALT_LEN: usize = 32;

/// The accepted symbol set for the "at least one symbol" rule.
pub const SYMBOL_SET: &str = "!@#$%^&*()_+-=[]{};':\"\\|,.<>/?`~";

/// Longest permitted run of identical consecutive characters.
const MAX_CHAR_RUN: usize = 2;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A stored credential: hash, salt, and the derivation parameters used.
///
/// Created at registration and replaced wholesale on password change —
/// never partially mutated. The record holds no plaintext material and is
/// safe to serialize for at-rest storage (the owning layer encrypts it).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRecord {
    /// PBKDF2-HMAC-SHA256 output (32 bytes).
    pub hash: Vec<u8>,
    /// Per-user random salt (32 bytes).
    pub salt: Vec<u8>,
    /// Derivation parameters the hash was produced with.
    pub params: Pbkdf2Params,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Validate a password against the strength policy.
///
/// Rules, checked in order:
/// 1. At least 12 characters
/// 2. At least one uppercase letter
/// 3. At least one lowercase letter
/// 4. At least one digit
/// 5. At least one symbol from [`SYMBOL_SET`]
/// 6. No run of more than 2 identical consecutive characters
///
/// # Errors
///
/// Returns [`CryptoError::WeakPassword`] naming the first violated rule.
pub fn validate_policy(password: &str) -> Result<(), CryptoError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(CryptoError::WeakPassword {
            reason: format!("must be at least {MIN_PASSWORD_LEN} characters"),
        });
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(CryptoError::WeakPassword {
            reason: "must contain an uppercase letter".to_owned(),
        });
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(CryptoError::WeakPassword {
            reason: "must contain a lowercase letter".to_owned(),
        });
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(CryptoError::WeakPassword {
            reason: "must contain a digit".to_owned(),
        });
    }
    if !password.chars().any(|c| SYMBOL_SET.contains(c)) {
        return Err(CryptoError::WeakPassword {
            reason: "must contain a symbol".to_owned(),
        });
    }
    if has_long_run(password) {
        return Err(CryptoError::WeakPassword {
            reason: format!("must not repeat a character more than {MAX_CHAR_RUN} times in a row"),
        });
    }
    Ok(())
}

/// Check for a run of more than [`MAX_CHAR_RUN`] identical characters.
fn has_long_run(s: &str) -> bool {
    let mut run = 0usize;
    let mut prev: Option<char> = None;
    for c in s.chars() {
        if prev == Some(c) {
            run = run.saturating_add(1);
            if run > MAX_CHAR_RUN {
                return true;
            }
        } else {
            run = 1;
            prev = Some(c);
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Hashing / verification
// ---------------------------------------------------------------------------

/// Hash a password with a fresh random 256-bit salt.
///
/// Policy validation is the caller's responsibility — this function hashes
/// whatever it is given (password changes and test fixtures reuse it).
///
/// # Errors
///
/// Returns `CryptoError::SecureMemory` if the CSPRNG fails, or
/// `CryptoError::KeyDerivation` if derivation fails.
pub fn hash_password(password: &str) -> Result<PasswordRecord, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| CryptoError::SecureMemory(format!("CSPRNG fill failed: {e}")))?;

    let params = Pbkdf2Params::default();
    let derived = kdf::derive(password.as_bytes(), &salt, &params)?;

    Ok(PasswordRecord {
        hash: derived.expose().to_vec(),
        salt: salt.to_vec(),
        params,
    })
}

/// Verify a password against a stored [`PasswordRecord`] in constant time.
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` if the stored record carries
/// invalid parameters. A wrong password is `Ok(false)`, not an error.
pub fn verify_password(password: &str, record: &PasswordRecord) -> Result<bool, CryptoError> {
    kdf::verify(
        password.as_bytes(),
        &record.salt,
        &record.params,
        &record.hash,
    )
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_PASSWORD: &str = "Correct-Horse7Battery";

    #[test]
    fn policy_accepts_compliant_password() {
        validate_policy(GOOD_PASSWORD).expect("compliant password should pass");
    }

    #[test]
    fn policy_rejects_short_password() {
        let err = validate_policy("Ab1!x").expect_err("short password should fail");
        assert!(format!("{err}").contains("at least 12 characters"));
    }

    #[test]
    fn policy_rejects_eleven_characters() {
        // One character under the floor, all classes present.
        let err = validate_policy("Abcdefg1!xy").expect_err("11 chars should fail");
        assert!(format!("{err}").contains("at least 12 characters"));
    }

    #[test]
    fn policy_rejects_missing_uppercase() {
        let err = validate_policy("lowercase-only7!").expect_err("should fail");
        assert!(format!("{err}").contains("uppercase"));
    }

    #[test]
    fn policy_rejects_missing_lowercase() {
        let err = validate_policy("UPPERCASE-ONLY7!").expect_err("should fail");
        assert!(format!("{err}").contains("lowercase"));
    }

    #[test]
    fn policy_rejects_missing_digit() {
        let err = validate_policy("NoDigitsHere!!").expect_err("should fail");
        assert!(format!("{err}").contains("digit"));
    }

    #[test]
    fn policy_rejects_missing_symbol() {
        let err = validate_policy("NoSymbolsHere77").expect_err("should fail");
        assert!(format!("{err}").contains("symbol"));
    }

    #[test]
    fn policy_rejects_triple_character_run() {
        let err = validate_policy("Aaabbb111!!!zz").expect_err("triple run should fail");
        assert!(format!("{err}").contains("in a row"));
    }

    #[test]
    fn policy_accepts_double_character_run() {
        validate_policy("AabB11!!ccDDe").expect("double runs are allowed");
    }

    #[test]
    fn policy_checks_length_first() {
        // Short AND missing classes — the length rule must be the reason.
        let err = validate_policy("abc").expect_err("should fail");
        assert!(format!("{err}").contains("at least 12 characters"));
    }

    #[test]
    fn hash_produces_distinct_salts() {
        let a = hash_password(GOOD_PASSWORD).expect("hash should succeed");
        let b = hash_password(GOOD_PASSWORD).expect("hash should succeed");
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn hash_salt_is_256_bits() {
        let record = hash_password(GOOD_PASSWORD).expect("hash should succeed");
        assert_eq!(record.salt.len(), SALT_LEN);
        assert_eq!(record.hash.len(), 32);
    }

    #[test]
    fn verify_roundtrip() {
        let record = hash_password(GOOD_PASSWORD).expect("hash should succeed");
        assert!(verify_password(GOOD_PASSWORD, &record).expect("verify should succeed"));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let record = hash_password(GOOD_PASSWORD).expect("hash should succeed");
        assert!(!verify_password("Wrong-Horse7Battery!", &record).expect("verify should succeed"));
    }

    #[test]
    fn record_serde_roundtrip() {
        let record = hash_password(GOOD_PASSWORD).expect("hash should succeed");
        let json = serde_json::to_string(&record).expect("serialize should succeed");
        let restored: PasswordRecord =
            serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(record, restored);
        assert!(verify_password(GOOD_PASSWORD, &restored).expect("verify should succeed"));
    }
}
