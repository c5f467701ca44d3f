//! `sentra-crypto-core` — Pure cryptographic primitives for Sentra.
//!
//! This crate is the audit target: zero async, zero platform dependencies.
//! Business logic (key management, authentication, auditing) lives in
//! `sentra-guard`.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod memory;

pub mod kdf;
pub mod symmetric;

pub mod password;

pub mod totp;

pub use error::CryptoError;
pub use kdf::{derive, Pbkdf2Params, DEFAULT_ITERATIONS, MIN_ITERATIONS};
pub use memory::{SecretBuffer, SecretBytes};
pub use password::{
    hash_password, validate_policy, verify_password, PasswordRecord, MIN_PASSWORD_LEN, SYMBOL_SET,
};
pub use symmetric::{open, seal, SealedBlob, IV_LEN, KEY_LEN, TAG_LEN};
pub use totp::{
    decode_secret, encode_secret, generate_backup_codes, generate_code, generate_secret,
    provisioning_uri, verify_code, BACKUP_CODE_COUNT, DIGITS, PERIOD, SECRET_LEN, WINDOW,
};
