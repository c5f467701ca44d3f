//! Key manager: master-key derivation, data-encryption keys, envelope
//! encryption, and key rotation.
//!
//! Key hierarchy:
//!
//! ```text
//! Passphrase / device secret ──► PBKDF2 ──► Master Key (memory only)
//! Master Key ──► wraps ──► Data Encryption Keys (persisted wrapped)
//! Active DEK ──► encrypts ──► application data (EncryptedData envelopes)
//! ```
//!
//! The master key is derived once per process and never persisted. Every
//! DEK is wrapped under the master key before it reaches the byte store.
//! Exactly one active, unexpired DEK serves new encryptions; rotation
//! demotes it but keeps it readable so old ciphertexts stay decryptable.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sentra_crypto_core::kdf::{self, Pbkdf2Params};
use sentra_crypto_core::memory::{SecretBuffer, SecretBytes};
use sentra_crypto_core::symmetric::{self, SealedBlob};
use sentra_crypto_core::CryptoError;

use crate::clock::Clock;
use crate::error::GuardError;
use crate::ids::generate_uuid;
use crate::store::{ns_key, SecureByteStore};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// DEK lifetime: 90 days.
pub const KEY_TTL_SECS: u64 = 90 * 24 * 60 * 60;

/// Rotation fires when the active key is within 7 days of expiry.
pub const ROTATION_LEAD_SECS: u64 = 7 * 24 * 60 * 60;

/// Algorithm tag recorded in every envelope.
pub const ALGORITHM: &str = "AES-256-GCM";

/// Store key for the master-KDF record (salt + params).
const MASTER_KDF_KEY: &str = "master/kdf";

/// Store key for the device-generated entropy secret.
const DEVICE_SECRET_KEY: &str = "master/device-secret";

/// Salt length for master derivation.
const MASTER_SALT_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Public metadata for a data-encryption key. Never carries raw material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    /// Stable key identifier (UUID).
    pub id: String,
    /// Algorithm tag.
    pub algorithm: String,
    /// Unix time the key was generated.
    pub created_at: u64,
    /// Unix time after which the key no longer serves new encryptions.
    pub expires_at: u64,
    /// Whether this key serves new encryptions.
    pub is_active: bool,
}

/// An immutable encrypted envelope.
///
/// `checksum` is blake3 over `(plaintext, key_id)` — tamper and wrong-key
/// detection independent of GCM's own authentication, so a decrypt under
/// the wrong retained key is caught even if the cipher layer were bypassed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// Id of the DEK that produced this ciphertext.
    pub key_id: String,
    /// Algorithm tag.
    pub algorithm: String,
    /// IV + ciphertext + GCM tag.
    pub sealed: SealedBlob,
    /// blake3(plaintext || key_id), hex-independent raw bytes.
    pub checksum: [u8; 32],
    /// Unix time the envelope was produced.
    pub created_at: u64,
}

/// Persisted form of a DEK: metadata plus master-wrapped material.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct KeyRecord {
    meta: EncryptionKey,
    wrapped: SealedBlob,
}

/// Master-KDF parameters persisted so the same master key can be re-derived
/// across restarts. Contains no secret material.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct MasterKdfRecord {
    salt: Vec<u8>,
    params: Pbkdf2Params,
}

struct LoadedKey {
    meta: EncryptionKey,
    material: SecretBytes<32>,
}

/// The key manager. One instance per process, injected by handle.
pub struct KeyRing {
    store: Arc<dyn SecureByteStore>,
    master: Option<SecretBytes<32>>,
    keys: HashMap<String, LoadedKey>,
    active_id: Option<String>,
    rotating: bool,
}

impl KeyRing {
    /// Create an uninitialized key ring over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn SecureByteStore>) -> Self {
        Self {
            store,
            master: None,
            keys: HashMap::new(),
            active_id: None,
            rotating: false,
        }
    }

    /// Whether [`initialize`](Self::initialize) has run.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.master.is_some()
    }

    /// Whether a rotation is currently in progress.
    #[must_use]
    pub const fn is_rotating(&self) -> bool {
        self.rotating
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// Derive the master key and load all wrapped DEKs from the store.
    ///
    /// The master key comes from `user_secret` when supplied, otherwise
    /// from a device-generated entropy secret created on first run and
    /// held by the platform byte store. Either way it is stretched through
    /// PBKDF2 with a persisted random salt and held only in memory.
    ///
    /// If no DEK exists yet, a first active key is generated.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Crypto`] on derivation failure or
    /// [`GuardError::Store`] on backend failure.
    pub fn initialize(
        &mut self,
        user_secret: Option<&[u8]>,
        clock: &dyn Clock,
    ) -> Result<(), GuardError> {
        let kdf_record = self.load_or_create_kdf_record()?;

        let master = match user_secret {
            Some(secret) => kdf::derive(secret, &kdf_record.salt, &kdf_record.params)?,
            None => {
                let device_secret = self.load_or_create_device_secret()?;
                kdf::derive(device_secret.expose(), &kdf_record.salt, &kdf_record.params)?
            }
        };
        self.master = Some(master);

        self.load_keys()?;
        if self.keys.is_empty() {
            let key = self.generate_key(true, clock)?;
            debug!(key_id = %key.id, "generated initial encryption key");
        }
        Ok(())
    }

    fn load_or_create_kdf_record(&self) -> Result<MasterKdfRecord, GuardError> {
        if let Some(bytes) = self.store.get(MASTER_KDF_KEY)? {
            return Ok(serde_json::from_slice(&bytes)?);
        }
        let salt = SecretBuffer::random(MASTER_SALT_LEN)?;
        let record = MasterKdfRecord {
            salt: salt.expose().to_vec(),
            params: Pbkdf2Params::default(),
        };
        self.store
            .set(MASTER_KDF_KEY, &serde_json::to_vec(&record)?, false)?;
        Ok(record)
    }

    fn load_or_create_device_secret(&self) -> Result<SecretBytes<32>, GuardError> {
        if let Some(bytes) = self.store.get(DEVICE_SECRET_KEY)? {
            let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                GuardError::Crypto(CryptoError::InvalidKeyMaterial(
                    "device secret has wrong length".into(),
                ))
            })?;
            return Ok(SecretBytes::new(arr));
        }
        let secret = SecretBytes::<32>::random()?;
        self.store
            .set(DEVICE_SECRET_KEY, secret.expose(), false)?;
        Ok(secret)
    }

    fn load_keys(&mut self) -> Result<(), GuardError> {
        let master = self.master.as_ref().ok_or(GuardError::NotInitialized)?;

        self.keys.clear();
        self.active_id = None;
        for store_key in self.store.list("keys/")? {
            let Some(bytes) = self.store.get(&store_key)? else {
                continue;
            };
            let record: KeyRecord = serde_json::from_slice(&bytes)?;
            let material =
                symmetric::open(&record.wrapped, master.expose(), record.meta.id.as_bytes())?;
            let arr: [u8; 32] = material.expose().try_into().map_err(|_| {
                GuardError::Crypto(CryptoError::InvalidKeyMaterial(
                    "unwrapped key has wrong length".into(),
                ))
            })?;
            if record.meta.is_active {
                self.active_id = Some(record.meta.id.clone());
            }
            self.keys.insert(
                record.meta.id.clone(),
                LoadedKey {
                    meta: record.meta,
                    material: SecretBytes::new(arr),
                },
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Key generation / rotation
    // -----------------------------------------------------------------------

    /// Generate a new DEK, wrap it under the master key, and persist it.
    ///
    /// With `activate` set, every previously active key is demoted first —
    /// at most one key is active at any time.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::NotInitialized`] before [`initialize`]
    /// (Self::initialize), or store/crypto errors.
    pub fn generate_key(
        &mut self,
        activate: bool,
        clock: &dyn Clock,
    ) -> Result<EncryptionKey, GuardError> {
        let master = self.master.as_ref().ok_or(GuardError::NotInitialized)?;

        let now = clock.now_unix();
        let id = generate_uuid();
        let material = SecretBytes::<32>::random()?;
        let wrapped = symmetric::seal(material.expose(), master.expose(), id.as_bytes())?;

        let meta = EncryptionKey {
            id: id.clone(),
            algorithm: ALGORITHM.to_owned(),
            created_at: now,
            expires_at: now.saturating_add(KEY_TTL_SECS),
            is_active: activate,
        };

        if activate {
            self.demote_active()?;
        }

        let record = KeyRecord {
            meta: meta.clone(),
            wrapped,
        };
        self.store
            .set(&ns_key(&id), &serde_json::to_vec(&record)?, false)?;

        self.keys.insert(
            id.clone(),
            LoadedKey {
                meta: meta.clone(),
                material,
            },
        );
        if activate {
            self.active_id = Some(id);
        }
        Ok(meta)
    }

    /// Demote every active key to inactive (retained, still decryptable).
    fn demote_active(&mut self) -> Result<(), GuardError> {
        let active_ids: Vec<String> = self
            .keys
            .values()
            .filter(|k| k.meta.is_active)
            .map(|k| k.meta.id.clone())
            .collect();

        for id in active_ids {
            if let Some(entry) = self.keys.get_mut(&id) {
                entry.meta.is_active = false;
                // Rewrap for persistence — the stored record must reflect
                // the demotion.
                let master = self.master.as_ref().ok_or(GuardError::NotInitialized)?;
                let wrapped =
                    symmetric::seal(entry.material.expose(), master.expose(), id.as_bytes())?;
                let record = KeyRecord {
                    meta: entry.meta.clone(),
                    wrapped,
                };
                self.store
                    .set(&ns_key(&id), &serde_json::to_vec(&record)?, false)?;
            }
        }
        self.active_id = None;
        Ok(())
    }

    /// Rotate: generate a new active key and demote all others.
    ///
    /// Retained keys stay loaded so ciphertexts referencing them remain
    /// decryptable until re-encrypted. Returns the new key's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::RotationInProgress`] if a rotation is already
    /// running — concurrent rotations are rejected, never queued.
    pub fn rotate(&mut self, reason: &str, clock: &dyn Clock) -> Result<EncryptionKey, GuardError> {
        if self.rotating {
            return Err(GuardError::RotationInProgress);
        }
        self.rotating = true;
        let result = self.generate_key(true, clock);
        self.rotating = false;

        match result {
            Ok(meta) => {
                info!(key_id = %meta.id, reason, "rotated encryption key");
                Ok(meta)
            }
            Err(e) => Err(e),
        }
    }

    /// Periodic rotation check — the host calls this roughly daily.
    ///
    /// No-ops when uninitialized or when the active key is not within
    /// [`ROTATION_LEAD_SECS`] of expiry. Returns the new key metadata when
    /// a rotation fired.
    ///
    /// # Errors
    ///
    /// Propagates rotation failures; the no-op paths never fail.
    pub fn rotation_tick(&mut self, clock: &dyn Clock) -> Result<Option<EncryptionKey>, GuardError> {
        if self.master.is_none() {
            return Ok(None);
        }
        let Some(active) = self.active_key() else {
            return Ok(None);
        };
        let now = clock.now_unix();
        if active.expires_at.saturating_sub(now) <= ROTATION_LEAD_SECS {
            let meta = self.rotate("scheduled: active key near expiry", clock)?;
            return Ok(Some(meta));
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Envelope encrypt / decrypt
    // -----------------------------------------------------------------------

    /// Encrypt a blob under the active key (or a specific key for the
    /// explicit re-encryption path).
    ///
    /// A fresh random IV is generated per call; the checksum binds the
    /// plaintext to the key id.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::KeyNotFound`] if `key_id` names an unknown
    /// key or no active unexpired key exists.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        key_id: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<EncryptedData, GuardError> {
        if self.master.is_none() {
            return Err(GuardError::NotInitialized);
        }
        let now = clock.now_unix();

        let entry = match key_id {
            Some(id) => self
                .keys
                .get(id)
                .ok_or_else(|| GuardError::KeyNotFound(id.to_owned()))?,
            None => {
                let active_id = self
                    .active_id
                    .as_deref()
                    .ok_or_else(|| GuardError::KeyNotFound("no active key".to_owned()))?;
                let entry = self
                    .keys
                    .get(active_id)
                    .ok_or_else(|| GuardError::KeyNotFound(active_id.to_owned()))?;
                if entry.meta.expires_at <= now {
                    return Err(GuardError::KeyNotFound(
                        "active key expired; rotation required".to_owned(),
                    ));
                }
                entry
            }
        };

        let checksum = envelope_checksum(plaintext, &entry.meta.id);
        let sealed = symmetric::seal(plaintext, entry.material.expose(), entry.meta.id.as_bytes())?;

        Ok(EncryptedData {
            key_id: entry.meta.id.clone(),
            algorithm: ALGORITHM.to_owned(),
            sealed,
            checksum,
            created_at: now,
        })
    }

    /// Decrypt an envelope, resolving its `key_id` against the loaded ring
    /// (active or retained keys).
    ///
    /// # Errors
    ///
    /// - [`GuardError::KeyNotFound`] — the referenced key is gone
    /// - [`GuardError::Integrity`] — GCM authentication or checksum failure
    pub fn decrypt(&self, data: &EncryptedData) -> Result<SecretBuffer, GuardError> {
        if self.master.is_none() {
            return Err(GuardError::NotInitialized);
        }
        let entry = self
            .keys
            .get(&data.key_id)
            .ok_or_else(|| GuardError::KeyNotFound(data.key_id.clone()))?;

        let plaintext = symmetric::open(
            &data.sealed,
            entry.material.expose(),
            data.key_id.as_bytes(),
        )
        .map_err(|e| match e {
            CryptoError::Decryption => GuardError::Integrity,
            other => GuardError::Crypto(other),
        })?;

        let expected = envelope_checksum(plaintext.expose(), &data.key_id);
        if expected != data.checksum {
            return Err(GuardError::Integrity);
        }
        Ok(plaintext)
    }

    /// Re-encrypt an envelope under the current active key.
    ///
    /// This is the migration path after rotation: old envelopes keep
    /// decrypting, and callers move them forward batch by batch.
    ///
    /// # Errors
    ///
    /// Propagates decrypt/encrypt failures.
    pub fn reencrypt(
        &self,
        data: &EncryptedData,
        clock: &dyn Clock,
    ) -> Result<EncryptedData, GuardError> {
        let plaintext = self.decrypt(data)?;
        self.encrypt(plaintext.expose(), None, clock)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Metadata for the currently active key, if any.
    #[must_use]
    pub fn active_key(&self) -> Option<&EncryptionKey> {
        self.active_id
            .as_deref()
            .and_then(|id| self.keys.get(id))
            .map(|entry| &entry.meta)
    }

    /// Metadata for every loaded key, active and retained.
    #[must_use]
    pub fn keys(&self) -> Vec<EncryptionKey> {
        let mut keys: Vec<EncryptionKey> = self.keys.values().map(|k| k.meta.clone()).collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        keys
    }

    #[cfg(test)]
    pub(crate) fn force_rotation_flag(&mut self, value: bool) {
        self.rotating = value;
    }
}

/// blake3 over `plaintext || key_id`.
fn envelope_checksum(plaintext: &[u8], key_id: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(plaintext);
    hasher.update(key_id.as_bytes());
    *hasher.finalize().as_bytes()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
