//! RFC 6238 TOTP generation and MFA provisioning material.
//!
//! This module provides:
//! - [`generate_code`] / [`verify_code`] — 6-digit HMAC-SHA1 codes with
//!   RFC 4226 dynamic truncation and a ±1 time-step validation window
//! - [`generate_secret`] — 160-bit random shared secret
//! - [`encode_secret`] / [`decode_secret`] — base32 (RFC 4648, no padding)
//! - [`provisioning_uri`] — standard `otpauth://totp/...` URI
//! - [`generate_backup_codes`] — single-use recovery codes

use data_encoding::BASE32_NOPAD;
use rand::rngs::OsRng;
use rand::RngCore;
use ring::hmac;

use crate::error::CryptoError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// TOTP time step in seconds (RFC 6238 §4).
pub const PERIOD: u64 = 30;

/// Validation window in time steps on each side of "now" (RFC 6238 §5.2).
pub const WINDOW: u64 = 1;

/// Number of output digits.
pub const DIGITS: usize = 6;

/// Shared secret length in bytes (160 bits, RFC 4226 §4 minimum).
pub const SECRET_LEN: usize = 20;

/// Number of backup codes issued per enrollment.
pub const BACKUP_CODE_COUNT: usize = 8;

/// Modulus for 6-digit truncation.
const CODE_MODULUS: u32 = 1_000_000;

/// Backup-code alphabet — uppercase letters and digits minus the
/// confusable set (0/O, 1/I/L).
const BACKUP_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

// ---------------------------------------------------------------------------
// Code generation / verification
// ---------------------------------------------------------------------------

/// Constant-time byte comparison for OTP codes.
///
/// The early return on length mismatch is acceptable because the expected
/// digit count is public information — the constant-time property protects
/// the code value, not its length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate the 6-digit code for one time step.
///
/// HMAC-SHA1 over the 8-byte big-endian counter, then RFC 4226 §5.3
/// dynamic truncation, zero-padded to 6 digits.
fn code_at_step(secret: &[u8], step: u64) -> Result<String, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::Otp("secret must not be empty".to_owned()));
    }

    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret);
    let tag = hmac::sign(&key, &step.to_be_bytes());
    let mac = tag.as_ref();

    // offset = low-order 4 bits of last byte.
    let offset = usize::from(mac[mac.len().wrapping_sub(1)] & 0x0F);

    // Extract 4 bytes starting at offset, mask high bit.
    let binary_code = u32::from_be_bytes([
        mac[offset] & 0x7F,
        mac[offset.wrapping_add(1)],
        mac[offset.wrapping_add(2)],
        mac[offset.wrapping_add(3)],
    ]);

    // CODE_MODULUS is a non-zero constant.
    #[allow(clippy::arithmetic_side_effects)]
    let code = binary_code % CODE_MODULUS;

    Ok(format!("{code:0>DIGITS$}"))
}

/// Generate the 6-digit TOTP code for the given unix time.
///
/// # Errors
///
/// Returns `CryptoError::Otp` if the secret is empty.
#[must_use = "OTP code should be used or displayed"]
pub fn generate_code(secret: &[u8], unix_time: u64) -> Result<String, CryptoError> {
    // PERIOD is a non-zero constant.
    #[allow(clippy::arithmetic_side_effects)]
    let step = unix_time / PERIOD;
    code_at_step(secret, step)
}

/// Verify a 6-digit TOTP code with a ±1 time-step window.
///
/// Checks T-1, T, and T+1 using constant-time comparison; any match
/// succeeds. Codes two or more steps away are rejected.
///
/// # Errors
///
/// Returns `CryptoError::Otp` if the secret is empty.
#[must_use = "validation result should be checked"]
pub fn verify_code(secret: &[u8], unix_time: u64, code: &str) -> Result<bool, CryptoError> {
    // PERIOD is a non-zero constant.
    #[allow(clippy::arithmetic_side_effects)]
    let step = unix_time / PERIOD;

    // Saturate at zero so time=0 checks steps 0..=1, not u64::MAX.
    let start = step.saturating_sub(WINDOW);
    let end = step.saturating_add(WINDOW);

    let mut valid = false;
    let mut current = start;
    loop {
        let expected = code_at_step(secret, current)?;
        if constant_time_eq(expected.as_bytes(), code.as_bytes()) {
            valid = true;
        }
        if current == end {
            break;
        }
        current = current.wrapping_add(1);
    }

    Ok(valid)
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

/// Generate a fresh 160-bit shared secret from the OS CSPRNG.
///
/// # Errors
///
/// Returns `CryptoError::Otp` if the CSPRNG fails.
pub fn generate_secret() -> Result<[u8; SECRET_LEN], CryptoError> {
    let mut secret = [0u8; SECRET_LEN];
    OsRng
        .try_fill_bytes(&mut secret)
        .map_err(|e| CryptoError::Otp(format!("CSPRNG fill failed: {e}")))?;
    Ok(secret)
}

/// Base32-encode a shared secret for display and URI embedding.
#[must_use]
pub fn encode_secret(secret: &[u8]) -> String {
    BASE32_NOPAD.encode(secret)
}

/// Decode a base32 shared secret (case-insensitive, padding ignored).
///
/// # Errors
///
/// Returns `CryptoError::Otp` if the input is not valid base32.
pub fn decode_secret(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    let normalized: String = encoded
        .chars()
        .filter(|c| *c != '=' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|e| CryptoError::Otp(format!("invalid base32 secret: {e}")))
}

/// Build the standard `otpauth://totp/` provisioning URI.
///
/// Shape: `otpauth://totp/{issuer}:{account}?secret=...&issuer=...`
/// `&algorithm=SHA1&digits=6&period=30`. Label components are
/// percent-encoded.
#[must_use]
pub fn provisioning_uri(secret: &[u8], account: &str, issuer: &str) -> String {
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm=SHA1&digits={DIGITS}&period={PERIOD}",
        percent_encode(issuer),
        percent_encode(account),
        encode_secret(secret),
        percent_encode(issuer),
    )
}

/// Percent-encode everything outside the URI unreserved set.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(char::from(byte));
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Backup codes
// ---------------------------------------------------------------------------

/// Generate [`BACKUP_CODE_COUNT`] single-use backup codes.
///
/// Each code is 8 characters in `XXXX-XXXX` form, drawn from an alphabet
/// without confusable characters. Consumption tracking is the caller's
/// responsibility.
///
/// # Errors
///
/// Returns `CryptoError::Otp` if the CSPRNG fails.
pub fn generate_backup_codes() -> Result<Vec<String>, CryptoError> {
    let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
    for _ in 0..BACKUP_CODE_COUNT {
        let mut raw = [0u8; 8];
        OsRng
            .try_fill_bytes(&mut raw)
            .map_err(|e| CryptoError::Otp(format!("CSPRNG fill failed: {e}")))?;
        // BACKUP_ALPHABET is a non-empty constant.
        #[allow(clippy::arithmetic_side_effects)]
        let chars: Vec<char> = raw
            .iter()
            .map(|b| char::from(BACKUP_ALPHABET[usize::from(*b) % BACKUP_ALPHABET.len()]))
            .collect();
        let first: String = chars[..4].iter().collect();
        let second: String = chars[4..].iter().collect();
        codes.push(format!("{first}-{second}"));
    }
    Ok(codes)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4226 Appendix D secret ("12345678901234567890").
    const RFC_SECRET: &[u8] = b"12345678901234567890";

    // RFC 4226 Appendix D — expected 6-digit codes for counters 0..9.
    const RFC4226_EXPECTED: [&str; 10] = [
        "755224", "287082", "359152", "969429", "338314", "254676", "287922", "162583", "399871",
        "520489",
    ];

    #[test]
    fn rfc4226_appendix_d_vectors() {
        for (counter, expected) in RFC4226_EXPECTED.iter().enumerate() {
            let code = code_at_step(RFC_SECRET, counter as u64).expect("generation");
            assert_eq!(
                &code, expected,
                "mismatch at counter {counter}: got {code}, expected {expected}"
            );
        }
    }

    #[test]
    fn rfc6238_time_59_sha1() {
        // RFC 6238 Appendix B: T=59 → step 1 → 8-digit 94287082, so the
        // 6-digit code is the low 6 digits: 287082.
        let code = generate_code(RFC_SECRET, 59).expect("generation");
        assert_eq!(code, "287082");
    }

    #[test]
    fn code_is_always_six_digits() {
        for t in [0u64, 59, 1_111_111_109, 1_234_567_890, 2_000_000_000] {
            let code = generate_code(RFC_SECRET, t).expect("generation");
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn verify_accepts_current_step() {
        let t = 1_234_567_890u64;
        let code = generate_code(RFC_SECRET, t).expect("generation");
        assert!(verify_code(RFC_SECRET, t, &code).expect("verify"));
    }

    #[test]
    fn verify_accepts_previous_step() {
        let t = 1_234_567_890u64;
        let code = generate_code(RFC_SECRET, t).expect("generation");
        assert!(verify_code(RFC_SECRET, t + 30, &code).expect("verify"));
    }

    #[test]
    fn verify_accepts_next_step() {
        let t = 1_234_567_890u64;
        let code = generate_code(RFC_SECRET, t + 30).expect("generation");
        assert!(verify_code(RFC_SECRET, t, &code).expect("verify"));
    }

    #[test]
    fn verify_rejects_two_steps_ahead() {
        let t = 1_234_567_890u64;
        let code = generate_code(RFC_SECRET, t).expect("generation");
        assert!(!verify_code(RFC_SECRET, t + 60, &code).expect("verify"));
    }

    #[test]
    fn verify_rejects_two_steps_behind() {
        let t = 1_234_567_890u64;
        let code = generate_code(RFC_SECRET, t + 60).expect("generation");
        assert!(!verify_code(RFC_SECRET, t, &code).expect("verify"));
    }

    #[test]
    fn verify_at_time_zero_does_not_wrap() {
        let code = generate_code(RFC_SECRET, 0).expect("generation");
        assert!(verify_code(RFC_SECRET, 0, &code).expect("verify"));
    }

    #[test]
    fn verify_rejects_wrong_length_code() {
        assert!(!verify_code(RFC_SECRET, 1_234_567_890, "12345").expect("verify"));
    }

    #[test]
    fn empty_secret_returns_error() {
        let result = generate_code(&[], 0);
        assert!(matches!(result, Err(CryptoError::Otp(_))));
    }

    #[test]
    fn generated_secret_has_160_bits() {
        let secret = generate_secret().expect("generation");
        assert_eq!(secret.len(), 20);
    }

    #[test]
    fn generated_secrets_are_unique() {
        let a = generate_secret().expect("generation");
        let b = generate_secret().expect("generation");
        assert_ne!(a, b);
    }

    #[test]
    fn secret_base32_roundtrip() {
        let secret = generate_secret().expect("generation");
        let encoded = encode_secret(&secret);
        let decoded = decode_secret(&encoded).expect("decode");
        assert_eq!(decoded, secret);
    }

    #[test]
    fn decode_secret_accepts_lowercase_and_padding() {
        let encoded = encode_secret(b"12345678901234567890");
        let sloppy = format!("{}===", encoded.to_ascii_lowercase());
        let decoded = decode_secret(&sloppy).expect("decode");
        assert_eq!(decoded, b"12345678901234567890");
    }

    #[test]
    fn decode_secret_rejects_invalid_input() {
        assert!(decode_secret("not base32 !!!").is_err());
    }

    #[test]
    fn provisioning_uri_shape() {
        let secret = b"12345678901234567890";
        let uri = provisioning_uri(secret, "alice@example.com", "Sentra");
        assert!(uri.starts_with("otpauth://totp/Sentra:alice%40example.com?secret="));
        assert!(uri.contains(&format!("secret={}", encode_secret(secret))));
        assert!(uri.contains("issuer=Sentra"));
        assert!(uri.contains("algorithm=SHA1"));
        assert!(uri.contains("digits=6"));
        assert!(uri.contains("period=30"));
    }

    #[test]
    fn provisioning_uri_percent_encodes_label() {
        let uri = provisioning_uri(b"secret bytes here 20", "a b", "My App");
        assert!(uri.contains("My%20App:a%20b"));
    }

    #[test]
    fn backup_codes_count_and_format() {
        let codes = generate_backup_codes().expect("generation");
        assert_eq!(codes.len(), BACKUP_CODE_COUNT);
        for code in &codes {
            assert_eq!(code.len(), 9, "XXXX-XXXX is 9 chars: {code}");
            assert_eq!(code.chars().nth(4), Some('-'));
            assert!(code
                .chars()
                .filter(|c| *c != '-')
                .all(|c| BACKUP_ALPHABET.contains(&(c as u8))));
        }
    }

    #[test]
    fn backup_codes_are_distinct() {
        let codes = generate_backup_codes().expect("generation");
        let mut unique = codes.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
    }
}
