//! MFA engine: TOTP enrollment, verification, and backup codes.
//!
//! Enrollment state is envelope-encrypted through the key manager before
//! it touches the byte store. An enrollment only counts after
//! [`MfaEngine::complete_setup`] sees one valid code — listing a secret in
//! a UI is not possession.
//!
//! Backup codes are stored as blake3 digests and consumed atomically: the
//! used marker is persisted before the verification result is returned, so
//! a code can never be replayed even across a crash at the wrong moment.

use std::sync::Arc;

use ring::constant_time;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sentra_crypto_core::totp;

use crate::clock::Clock;
use crate::error::GuardError;
use crate::keyring::{EncryptedData, KeyRing};
use crate::store::{ns_mfa, SecureByteStore};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Material handed to the user exactly once at enrollment.
#[derive(Clone, Debug)]
pub struct TotpProvisioning {
    /// Base32 (RFC 4648, no padding) shared secret for manual entry.
    pub secret_base32: String,
    /// `otpauth://totp/...` URI for QR provisioning.
    pub uri: String,
    /// Single-use recovery codes, `XXXX-XXXX`.
    pub backup_codes: Vec<String>,
}

/// How a second-factor check succeeded, or that it did not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MfaOutcome {
    /// A current TOTP code matched.
    Totp,
    /// A backup code matched and was consumed.
    Backup {
        /// Unused codes left after this consumption.
        remaining: usize,
    },
    /// Neither path matched.
    Rejected,
}

impl MfaOutcome {
    /// Whether the check passed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupCodeRecord {
    /// blake3 digest of the normalized code.
    digest: [u8; 32],
    used: bool,
}

/// Decrypted enrollment state. Never leaves this module.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Enrollment {
    secret: Vec<u8>,
    backup_codes: Vec<BackupCodeRecord>,
    /// Set once a live code has been demonstrated.
    confirmed: bool,
    created_at: u64,
}

/// The MFA engine. Stateless between calls — enrollment lives encrypted in
/// the byte store.
pub struct MfaEngine {
    store: Arc<dyn SecureByteStore>,
    issuer: String,
}

impl MfaEngine {
    /// Create an engine; `issuer` labels provisioning URIs.
    #[must_use]
    pub fn new(store: Arc<dyn SecureByteStore>, issuer: impl Into<String>) -> Self {
        Self {
            store,
            issuer: issuer.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Enrollment
    // -----------------------------------------------------------------------

    /// Begin TOTP enrollment: fresh 160-bit secret, provisioning URI, and
    /// 8 backup codes.
    ///
    /// Re-running setup replaces any previous enrollment and resets the
    /// confirmed flag — the user must demonstrate possession again.
    ///
    /// # Errors
    ///
    /// Propagates crypto/store failures.
    pub fn setup_totp(
        &self,
        user_id: &str,
        account: &str,
        keyring: &KeyRing,
        clock: &dyn Clock,
    ) -> Result<TotpProvisioning, GuardError> {
        let secret = totp::generate_secret()?;
        let backup_codes = totp::generate_backup_codes()?;

        let enrollment = Enrollment {
            secret: secret.to_vec(),
            backup_codes: backup_codes
                .iter()
                .map(|code| BackupCodeRecord {
                    digest: code_digest(code),
                    used: false,
                })
                .collect(),
            confirmed: false,
            created_at: clock.now_unix(),
        };
        self.persist(user_id, &enrollment, keyring, clock)?;

        debug!(user_id, "TOTP enrollment started");
        Ok(TotpProvisioning {
            secret_base32: totp::encode_secret(&secret),
            uri: totp::provisioning_uri(&secret, account, &self.issuer),
            backup_codes,
        })
    }

    /// Confirm enrollment by verifying one live TOTP code.
    ///
    /// Backup codes are not accepted here — only a generated code proves
    /// the authenticator app holds the secret. Returns `true` when the
    /// enrollment is now confirmed; the caller flips the account's TOTP
    /// flag on success.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::MfaNotConfigured`] with no pending enrollment.
    pub fn complete_setup(
        &self,
        user_id: &str,
        code: &str,
        keyring: &KeyRing,
        clock: &dyn Clock,
    ) -> Result<bool, GuardError> {
        let mut enrollment = self.load(user_id, keyring)?;
        if !totp::verify_code(&enrollment.secret, clock.now_unix(), code.trim())? {
            warn!(user_id, "TOTP setup confirmation failed");
            return Ok(false);
        }
        enrollment.confirmed = true;
        self.persist(user_id, &enrollment, keyring, clock)?;
        debug!(user_id, "TOTP enrollment confirmed");
        Ok(true)
    }

    /// Remove a user's enrollment entirely.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Store`] on backend failure.
    pub fn disable(&self, user_id: &str) -> Result<(), GuardError> {
        self.store.delete(&ns_mfa(user_id))
    }

    /// Whether the user has a confirmed enrollment.
    ///
    /// # Errors
    ///
    /// Propagates store/crypto failures; a missing enrollment is `false`.
    pub fn is_enrolled(&self, user_id: &str, keyring: &KeyRing) -> Result<bool, GuardError> {
        match self.load(user_id, keyring) {
            Ok(enrollment) => Ok(enrollment.confirmed),
            Err(GuardError::MfaNotConfigured) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Verification
    // -----------------------------------------------------------------------

    /// Verify a second factor: current TOTP code first, backup-code
    /// fallback second.
    ///
    /// A matching backup code is marked used and persisted before the
    /// success is reported. An already-consumed code is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::MfaNotConfigured`] when no confirmed
    /// enrollment exists.
    pub fn verify(
        &self,
        user_id: &str,
        code: &str,
        keyring: &KeyRing,
        clock: &dyn Clock,
    ) -> Result<MfaOutcome, GuardError> {
        let mut enrollment = self.load(user_id, keyring)?;
        if !enrollment.confirmed {
            return Err(GuardError::MfaNotConfigured);
        }

        let code = code.trim();
        if totp::verify_code(&enrollment.secret, clock.now_unix(), code)? {
            return Ok(MfaOutcome::Totp);
        }

        let digest = code_digest(code);
        let matched = enrollment.backup_codes.iter_mut().find(|record| {
            !record.used
                && constant_time::verify_slices_are_equal(&record.digest, &digest).is_ok()
        });
        if let Some(record) = matched {
            record.used = true;
            // Consumption must hit the store before success is reported.
            self.persist(user_id, &enrollment, keyring, clock)?;
            let remaining = enrollment.backup_codes.iter().filter(|r| !r.used).count();
            warn!(user_id, remaining, "backup code consumed");
            return Ok(MfaOutcome::Backup { remaining });
        }

        warn!(user_id, "second-factor verification rejected");
        Ok(MfaOutcome::Rejected)
    }

    /// Count of unused backup codes.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::MfaNotConfigured`] when no enrollment exists.
    pub fn remaining_backup_codes(
        &self,
        user_id: &str,
        keyring: &KeyRing,
    ) -> Result<usize, GuardError> {
        let enrollment = self.load(user_id, keyring)?;
        Ok(enrollment.backup_codes.iter().filter(|r| !r.used).count())
    }

    /// Replace all backup codes with a fresh set of 8. Requires a
    /// confirmed enrollment.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::MfaNotConfigured`] without one.
    pub fn regenerate_backup_codes(
        &self,
        user_id: &str,
        keyring: &KeyRing,
        clock: &dyn Clock,
    ) -> Result<Vec<String>, GuardError> {
        let mut enrollment = self.load(user_id, keyring)?;
        if !enrollment.confirmed {
            return Err(GuardError::MfaNotConfigured);
        }
        let codes = totp::generate_backup_codes()?;
        enrollment.backup_codes = codes
            .iter()
            .map(|code| BackupCodeRecord {
                digest: code_digest(code),
                used: false,
            })
            .collect();
        self.persist(user_id, &enrollment, keyring, clock)?;
        Ok(codes)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn load(&self, user_id: &str, keyring: &KeyRing) -> Result<Enrollment, GuardError> {
        let bytes = self
            .store
            .get(&ns_mfa(user_id))?
            .ok_or(GuardError::MfaNotConfigured)?;
        let envelope: EncryptedData = serde_json::from_slice(&bytes)?;
        let plaintext = keyring.decrypt(&envelope)?;
        Ok(serde_json::from_slice(plaintext.expose())?)
    }

    fn persist(
        &self,
        user_id: &str,
        enrollment: &Enrollment,
        keyring: &KeyRing,
        clock: &dyn Clock,
    ) -> Result<(), GuardError> {
        let plaintext = serde_json::to_vec(enrollment)?;
        let envelope = keyring.encrypt(&plaintext, None, clock)?;
        self.store
            .set(&ns_mfa(user_id), &serde_json::to_vec(&envelope)?, false)
    }
}

/// blake3 digest of a normalized code (dashes and whitespace stripped,
/// uppercased).
fn code_digest(code: &str) -> [u8; 32] {
    let normalized: String = code
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    *blake3::hash(normalized.as_bytes()).as_bytes()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
