//! Secure byte-store contract and in-memory reference implementation.
//!
//! The platform keychain/keystore is the only shared mutable resource in
//! the core. Components never touch it directly — they go through
//! [`SecureByteStore`], an opaque per-key get/set/delete of binary blobs.
//! Some keys are written with a "requires user presence" flag: the backend
//! must refuse to read them until a platform user-presence (biometric)
//! check has passed.
//!
//! Keys are namespaced by a stable prefix (see the `ns_*` helpers) so no
//! two components ever write the same underlying key.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::GuardError;

// ---------------------------------------------------------------------------
// Namespacing
// ---------------------------------------------------------------------------

/// Store key for a wrapped encryption key.
#[must_use]
pub fn ns_key(key_id: &str) -> String {
    format!("keys/{key_id}")
}

/// Store key for a user record.
#[must_use]
pub fn ns_user(user_id: &str) -> String {
    format!("users/{user_id}")
}

/// Store key for the email → user-id index (email already lowercased).
#[must_use]
pub fn ns_email(email: &str) -> String {
    format!("emails/{email}")
}

/// Store key for a user's credential record.
#[must_use]
pub fn ns_credential(user_id: &str) -> String {
    format!("credentials/{user_id}")
}

/// Store key for a user's MFA enrollment (TOTP secret + backup codes).
#[must_use]
pub fn ns_mfa(user_id: &str) -> String {
    format!("mfa/{user_id}")
}

/// Store key for a user's biometric-gated key reference.
#[must_use]
pub fn ns_biometric(user_id: &str) -> String {
    format!("biometric/{user_id}")
}

/// Store key for a persisted audit record.
#[must_use]
pub fn ns_audit(log_id: &str) -> String {
    format!("audit/{log_id}")
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Opaque byte storage with optional user-presence gating.
///
/// Implementations use interior mutability — the store is shared across
/// components behind an `Arc`.
pub trait SecureByteStore: Send + Sync {
    /// Read a blob. `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::UserPresenceRequired`] for a presence-gated
    /// key when no user-presence check has passed, or
    /// [`GuardError::Store`] on backend failure.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, GuardError>;

    /// Write a blob, replacing any existing value.
    ///
    /// When `require_user_presence` is set, subsequent reads must be gated
    /// by a platform user-presence check.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Store`] on backend failure.
    fn set(&self, key: &str, value: &[u8], require_user_presence: bool) -> Result<(), GuardError>;

    /// Delete a blob. Deleting a missing key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Store`] on backend failure.
    fn delete(&self, key: &str) -> Result<(), GuardError>;

    /// List all keys under a prefix. Used by the key manager to reload
    /// wrapped keys and by audit queries.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Store`] on backend failure.
    fn list(&self, prefix: &str) -> Result<Vec<String>, GuardError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct Slot {
    bytes: Vec<u8>,
    gated: bool,
}

/// In-memory [`SecureByteStore`] for tests and hosts without a platform
/// keychain.
///
/// User presence is modeled as a latch: the biometric gate raises it after
/// a successful platform prompt and drops it when the flow completes.
/// Reads of gated keys fail while the latch is down.
#[derive(Default)]
pub struct MemoryByteStore {
    slots: RwLock<HashMap<String, Slot>>,
    user_present: AtomicBool,
    /// When set, every operation fails — used to test queue retention on
    /// transient persistence failures.
    fail_writes: AtomicBool,
}

impl MemoryByteStore {
    /// Create an empty store with the presence latch down.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise or drop the user-presence latch.
    pub fn set_user_present(&self, present: bool) {
        self.user_present.store(present, Ordering::SeqCst);
    }

    /// Make all writes fail (transient-failure simulation).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl SecureByteStore for MemoryByteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, GuardError> {
        let slots = self.slots.read();
        match slots.get(key) {
            None => Ok(None),
            Some(slot) => {
                if slot.gated && !self.user_present.load(Ordering::SeqCst) {
                    return Err(GuardError::UserPresenceRequired(key.to_owned()));
                }
                Ok(Some(slot.bytes.clone()))
            }
        }
    }

    fn set(&self, key: &str, value: &[u8], require_user_presence: bool) -> Result<(), GuardError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GuardError::Store("simulated write failure".into()));
        }
        self.slots.write().insert(
            key.to_owned(),
            Slot {
                bytes: value.to_vec(),
                gated: require_user_presence,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), GuardError> {
        self.slots.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, GuardError> {
        let slots = self.slots.read();
        let mut keys: Vec<String> = slots
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
