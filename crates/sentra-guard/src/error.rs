//! Error types for `sentra-guard`.

use sentra_crypto_core::CryptoError;
use thiserror::Error;

/// Errors produced by the credential and trust core.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Cryptographic operation failed (delegated from crypto-core).
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Malformed or policy-violating input. Always surfaced, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Wrong email or password. Deliberately generic — the caller cannot
    /// distinguish "no such user" from "wrong password".
    #[error("invalid credentials")]
    InvalidCredentials,

    /// An account with this email already exists (case-insensitive).
    #[error("an account with this email already exists")]
    DuplicateEmail,

    /// Envelope checksum mismatch on decrypt — tampering or wrong key.
    /// Fatal for that datum; not retried.
    #[error("integrity check failed")]
    Integrity,

    /// The key referenced by a ciphertext is unknown — deleted or never
    /// synced. Unrecoverable for that ciphertext.
    #[error("encryption key not found: {0}")]
    KeyNotFound(String),

    /// A key rotation is already running. Callers retry later rather than
    /// queueing behind it.
    #[error("key rotation already in progress")]
    RotationInProgress,

    /// The key manager has not been initialized with a master key.
    #[error("key manager not initialized")]
    NotInitialized,

    /// Platform capability missing (no biometric hardware or enrollment).
    /// Surfaced as a capability result where possible, not an exception.
    #[error("platform unavailable: {0}")]
    PlatformUnavailable(String),

    /// Reading a presence-gated store key without a user-presence check.
    #[error("user presence required for key: {0}")]
    UserPresenceRequired(String),

    /// Byte-store backend failure.
    #[error("store error: {0}")]
    Store(String),

    /// No user with the given id.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// No threat with the given id.
    #[error("threat not found: {0}")]
    ThreatNotFound(String),

    /// Auth token failed signature or shape validation.
    #[error("invalid token")]
    TokenInvalid,

    /// Auth token is past its expiry.
    #[error("token expired")]
    TokenExpired,

    /// TOTP was never set up (or setup never completed) for this user.
    #[error("MFA not configured for user")]
    MfaNotConfigured,

    /// Serialization of a persisted record failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
