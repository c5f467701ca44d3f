//! AES-256-GCM authenticated encryption.
//!
//! This module provides:
//! - [`seal`] — encrypt plaintext with a fresh random IV, returning [`SealedBlob`]
//! - [`open`] — decrypt and authenticate a [`SealedBlob`]
//!
//! The IV is generated from `OsRng` per call and is never reused for a
//! given key. Callers that need tamper detection independent of GCM's own
//! tag (wrong-key detection across a key ring) layer a checksum on top —
//! see the envelope types in `sentra-guard`.

use crate::error::CryptoError;
use crate::memory::SecretBuffer;
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// AES-256-GCM IV length in bytes (96 bits).
pub const IV_LEN: usize = 12;

/// AES-256-GCM authentication tag length in bytes (128 bits).
pub const TAG_LEN: usize = 16;

/// AES-256-GCM key length in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Minimum valid serialized length: IV + empty ciphertext + tag.
const MIN_SEALED_LEN: usize = IV_LEN + TAG_LEN;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Authenticated ciphertext container — IV + ciphertext + tag.
///
/// Wire format: `iv (12 bytes) || ciphertext (variable) || tag (16 bytes)`.
/// Any modification to the IV, ciphertext, or tag causes [`open`] to fail.
#[must_use = "encrypted data must be stored or transmitted"]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    /// 96-bit random IV, unique per encryption.
    pub iv: [u8; IV_LEN],
    /// Encrypted data (same length as original plaintext).
    pub ciphertext: Vec<u8>,
    /// 128-bit authentication tag.
    pub tag: [u8; TAG_LEN],
}

impl SealedBlob {
    /// Serialize to wire format: `iv || ciphertext || tag`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let capacity = IV_LEN
            .saturating_add(self.ciphertext.len())
            .saturating_add(TAG_LEN);
        let mut out = Vec::with_capacity(capacity);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Deserialize from wire format: `iv || ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Encryption` if the input is shorter than 28
    /// bytes (12-byte IV + 0-byte ciphertext + 16-byte tag).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < MIN_SEALED_LEN {
            return Err(CryptoError::Encryption(format!(
                "sealed blob too short: {} bytes (minimum {MIN_SEALED_LEN})",
                bytes.len()
            )));
        }

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[..IV_LEN]);

        let ct_end = bytes
            .len()
            .checked_sub(TAG_LEN)
            .ok_or_else(|| CryptoError::Encryption("sealed blob length underflow".into()))?;
        let ciphertext = bytes[IV_LEN..ct_end].to_vec();

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&bytes[ct_end..]);

        Ok(Self {
            iv,
            ciphertext,
            tag,
        })
    }
}

// ---------------------------------------------------------------------------
// Seal / open
// ---------------------------------------------------------------------------

/// Encrypt plaintext using AES-256-GCM with a fresh random 96-bit IV.
///
/// # Arguments
///
/// - `plaintext` — data to encrypt (may be empty)
/// - `key` — exactly 32 bytes (256-bit AES key)
/// - `aad` — additional authenticated data (authenticated but not encrypted)
///
/// # Errors
///
/// Returns `CryptoError::Encryption` if the key is not exactly 32 bytes or
/// the underlying encryption operation fails.
pub fn seal(plaintext: &[u8], key: &[u8], aad: &[u8]) -> Result<SealedBlob, CryptoError> {
    let less_safe_key = make_key(key)?;

    let mut iv_bytes = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv_bytes);
    let nonce = aead::Nonce::assume_unique_for_key(iv_bytes);

    // Encrypt in place — plaintext buffer becomes ciphertext.
    let mut in_out = plaintext.to_vec();
    let Ok(tag) =
        less_safe_key.seal_in_place_separate_tag(nonce, aead::Aad::from(aad), &mut in_out)
    else {
        in_out.zeroize();
        return Err(CryptoError::Encryption(
            "AES-256-GCM encryption failed".into(),
        ));
    };

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_ref());

    Ok(SealedBlob {
        iv: iv_bytes,
        ciphertext: in_out,
        tag: tag_bytes,
    })
}

/// Decrypt an AES-256-GCM [`SealedBlob`].
///
/// Returns the plaintext as a [`SecretBuffer`] (zeroized on drop).
///
/// # Errors
///
/// Returns `CryptoError::Encryption` if the key is not exactly 32 bytes.
/// Returns `CryptoError::Decryption` if authentication fails (tampered
/// data, wrong key, or wrong AAD).
pub fn open(sealed: &SealedBlob, key: &[u8], aad: &[u8]) -> Result<SecretBuffer, CryptoError> {
    let less_safe_key = make_key(key)?;
    let nonce = aead::Nonce::assume_unique_for_key(sealed.iv);

    // Build ciphertext || tag buffer for open_in_place.
    let mut ct_tag = Vec::with_capacity(sealed.ciphertext.len().saturating_add(TAG_LEN));
    ct_tag.extend_from_slice(&sealed.ciphertext);
    ct_tag.extend_from_slice(&sealed.tag);

    let plaintext_slice = less_safe_key
        .open_in_place(nonce, aead::Aad::from(aad), &mut ct_tag)
        .map_err(|_| CryptoError::Decryption)?;

    let result = SecretBuffer::new(plaintext_slice);
    ct_tag.zeroize();
    Ok(result)
}

fn make_key(key: &[u8]) -> Result<aead::LessSafeKey, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::Encryption(format!(
            "invalid key length: {} bytes (expected {KEY_LEN})",
            key.len()
        )));
    }
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|_| CryptoError::Encryption("failed to create AES-256-GCM key".into()))?;
    Ok(aead::LessSafeKey::new(unbound))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
