//! Random identifier generation.

use data_encoding::HEXLOWER;
use rand::rngs::OsRng;
use rand::RngCore;

/// Generate a random version-4 UUID string.
#[must_use]
pub fn generate_uuid() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);

    // Version 4, RFC 4122 variant.
    bytes[6] = (bytes[6] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;

    let hex = HEXLOWER.encode(&bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..],
    )
}

/// Generate a random opaque token of `len` bytes, hex-encoded.
#[must_use]
pub fn generate_opaque_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    HEXLOWER.encode(&bytes)
}
