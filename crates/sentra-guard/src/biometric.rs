//! Biometric gate: platform abstraction and the two-condition unlock rule.
//!
//! The platform (Touch ID, Windows Hello, Android keystore) is behind
//! [`BiometricPlatform`] — the gate itself contains no OS calls. A
//! successful authentication requires BOTH a fresh platform prompt
//! confirmation AND a readable presence-gated key: a spoofed prompt result
//! without keystore cooperation unlocks nothing, and vice versa.
//!
//! User cancellation is an outcome, not an error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::GuardError;
use crate::keyring::{EncryptedData, KeyRing};
use crate::store::{ns_biometric, SecureByteStore};

// ---------------------------------------------------------------------------
// Platform contract
// ---------------------------------------------------------------------------

/// Biometric modality reported by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiometricType {
    Fingerprint,
    Face,
    Iris,
    Voice,
}

/// Result of a platform prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The user passed the biometric check.
    Confirmed,
    /// The user dismissed the prompt.
    Cancelled,
    /// The platform could not show a prompt (hardware busy, lockout).
    Unavailable(String),
}

/// Host-provided biometric backend.
pub trait BiometricPlatform: Send + Sync {
    /// Whether the device has biometric hardware at all.
    fn has_hardware(&self) -> bool;

    /// Whether at least one biometric credential is enrolled with the OS.
    fn is_enrolled(&self) -> bool;

    /// Modalities the hardware supports.
    fn supported_types(&self) -> Vec<BiometricType>;

    /// Show the platform prompt with a user-facing reason string.
    ///
    /// A confirmed prompt is expected to make presence-gated store keys
    /// readable for the current flow.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::PlatformUnavailable`] only for hard platform
    /// faults; cancellation and soft unavailability are outcomes.
    fn prompt(&self, reason: &str) -> Result<PromptOutcome, GuardError>;
}

/// Capability snapshot. Reported as data, never as an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiometricCapability {
    /// Hardware present AND a credential enrolled.
    pub available: bool,
    pub has_hardware: bool,
    pub enrolled: bool,
    pub supported_types: Vec<BiometricType>,
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Length of the per-user gate secret.
const GATE_SECRET_LEN: usize = 32;

/// The biometric gate.
pub struct BiometricGate {
    store: Arc<dyn SecureByteStore>,
    platform: Arc<dyn BiometricPlatform>,
}

impl BiometricGate {
    #[must_use]
    pub fn new(store: Arc<dyn SecureByteStore>, platform: Arc<dyn BiometricPlatform>) -> Self {
        Self { store, platform }
    }

    /// Snapshot the platform's biometric capability.
    #[must_use]
    pub fn check_availability(&self) -> BiometricCapability {
        let has_hardware = self.platform.has_hardware();
        let enrolled = self.platform.is_enrolled();
        BiometricCapability {
            available: has_hardware && enrolled,
            has_hardware,
            enrolled,
            supported_types: self.platform.supported_types(),
        }
    }

    /// Whether biometric unlock has been set up for this user.
    ///
    /// Checks key existence only — no gated read, no prompt.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Store`] on backend failure.
    pub fn is_setup(&self, user_id: &str) -> Result<bool, GuardError> {
        let target = ns_biometric(user_id);
        Ok(self.store.list("biometric/")?.contains(&target))
    }

    /// Enroll a user: prompt first, write key material only after the
    /// prompt confirms.
    ///
    /// The gate secret is envelope-encrypted and stored behind the
    /// require-user-presence flag. Returns the enrolled modality (the
    /// platform's preferred one), or `None` on user cancellation with
    /// nothing written.
    ///
    /// # Errors
    ///
    /// - [`GuardError::PlatformUnavailable`] — no hardware or enrollment
    /// - store/crypto failures
    pub fn setup(
        &self,
        user_id: &str,
        keyring: &KeyRing,
        clock: &dyn Clock,
    ) -> Result<Option<BiometricType>, GuardError> {
        let capability = self.check_availability();
        if !capability.available {
            return Err(GuardError::PlatformUnavailable(
                "biometric hardware missing or not enrolled".into(),
            ));
        }
        let Some(biometric_type) = capability.supported_types.first().copied() else {
            return Err(GuardError::PlatformUnavailable(
                "platform reports no biometric modality".into(),
            ));
        };

        match self.platform.prompt("Enable biometric unlock")? {
            PromptOutcome::Confirmed => {}
            PromptOutcome::Cancelled => {
                debug!(user_id, "biometric setup cancelled");
                return Ok(None);
            }
            PromptOutcome::Unavailable(reason) => {
                return Err(GuardError::PlatformUnavailable(reason));
            }
        }

        let secret = sentra_crypto_core::memory::SecretBuffer::random(GATE_SECRET_LEN)?;
        let envelope = keyring.encrypt(secret.expose(), None, clock)?;
        self.store
            .set(&ns_biometric(user_id), &serde_json::to_vec(&envelope)?, true)?;
        debug!(user_id, ?biometric_type, "biometric unlock enrolled");
        Ok(Some(biometric_type))
    }

    /// Authenticate: fresh prompt AND readable gated key, both required.
    ///
    /// Returns `false` for cancellation, for a prompt success with an
    /// unreadable key (the caller may retry), and for missing enrollment.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::PlatformUnavailable`] for hard platform
    /// faults; soft failures are `Ok(false)`.
    pub fn authenticate(
        &self,
        user_id: &str,
        reason: &str,
        keyring: &KeyRing,
    ) -> Result<bool, GuardError> {
        if !self.is_setup(user_id)? {
            return Ok(false);
        }

        match self.platform.prompt(reason)? {
            PromptOutcome::Confirmed => {}
            PromptOutcome::Cancelled => {
                debug!(user_id, "biometric prompt cancelled");
                return Ok(false);
            }
            PromptOutcome::Unavailable(reason) => {
                return Err(GuardError::PlatformUnavailable(reason));
            }
        }

        // Prompt passed; the gated key must now be readable and decrypt
        // to well-formed material.
        let bytes = match self.store.get(&ns_biometric(user_id)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                warn!(user_id, "gated key vanished after prompt");
                return Ok(false);
            }
            Err(GuardError::UserPresenceRequired(_)) => {
                warn!(user_id, "gated key unreadable after confirmed prompt");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let envelope: EncryptedData = serde_json::from_slice(&bytes)?;
        match keyring.decrypt(&envelope) {
            Ok(secret) if secret.len() == GATE_SECRET_LEN => Ok(true),
            Ok(_) | Err(GuardError::Integrity) => {
                warn!(user_id, "biometric gate secret failed integrity");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a user's biometric enrollment.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Store`] on backend failure.
    pub fn remove(&self, user_id: &str) -> Result<(), GuardError> {
        self.store.delete(&ns_biometric(user_id))
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
