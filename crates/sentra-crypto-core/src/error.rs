//! Cryptographic error types for `sentra-crypto-core`.

use thiserror::Error;

/// Errors produced by cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key derivation failed (PBKDF2 parameter validation, salt length).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Symmetric encryption failure (AES-256-GCM).
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Authentication tag verification failed — ciphertext tampered or wrong key.
    #[error("decryption failed: authentication tag mismatch")]
    Decryption,

    /// Invalid key material (wrong length, corrupted bytes).
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// TOTP/HOTP generation or validation error.
    #[error("OTP error: {0}")]
    Otp(String),

    /// Password violates the strength policy. The reason names the first
    /// failed rule so the caller can surface it verbatim.
    #[error("weak password: {reason}")]
    WeakPassword {
        /// Human-readable description of the first violated rule.
        reason: String,
    },

    /// Secure memory allocation failure.
    #[error("secure memory error: {0}")]
    SecureMemory(String),
}
