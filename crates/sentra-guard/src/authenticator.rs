//! Credential authenticator: registration, login, tokens, and per-user
//! security settings.
//!
//! Design rules:
//! - Login failures are indistinguishable — unknown email and wrong
//!   password both return [`GuardError::InvalidCredentials`], and the
//!   unknown-email path burns an equivalent KDF cost.
//! - Access tokens are HMAC-SHA256 signed claims, 24 h lifetime. When MFA
//!   is enabled, login yields a 5-minute token scoped to MFA completion
//!   instead of a full pair.
//! - Refresh tokens are opaque random strings, rotated on every use.

use std::collections::HashMap;
use std::sync::Arc;

use data_encoding::BASE64URL_NOPAD;
use ring::hmac;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sentra_crypto_core::memory::SecretBytes;
use sentra_crypto_core::password::{self, PasswordRecord};

use crate::biometric::BiometricType;

use crate::clock::Clock;
use crate::error::GuardError;
use crate::ids::{generate_opaque_token, generate_uuid};
use crate::store::{ns_credential, ns_email, ns_user, SecureByteStore};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Access-token lifetime: 24 hours.
pub const ACCESS_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// MFA-scoped token lifetime: 5 minutes.
pub const MFA_TOKEN_TTL_SECS: u64 = 5 * 60;

/// Refresh-token lifetime: 30 days.
pub const REFRESH_TOKEN_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Refresh-token entropy in bytes.
const REFRESH_TOKEN_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Per-user security preferences.
///
/// Invariant: any enabled second factor implies `mfa_enabled`. The setters
/// normalize rather than reject, so a stored record is always consistent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub mfa_enabled: bool,
    pub totp_enabled: bool,
    pub biometric_enabled: bool,
    /// Modality enrolled through the biometric gate, when known.
    #[serde(default)]
    pub biometric_type: Option<BiometricType>,
    pub sms_enabled: bool,
    /// Device identifiers exempt from step-up prompts.
    pub trusted_devices: Vec<String>,
    pub session_timeout_minutes: u32,
    pub auto_lock_minutes: u32,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            mfa_enabled: false,
            totp_enabled: false,
            biometric_enabled: false,
            biometric_type: None,
            sms_enabled: false,
            trusted_devices: Vec::new(),
            session_timeout_minutes: 30,
            auto_lock_minutes: 5,
        }
    }
}

impl SecuritySettings {
    /// Restore the factor → `mfa_enabled` implication after edits.
    fn normalize(&mut self) {
        if self.totp_enabled || self.biometric_enabled || self.sms_enabled {
            self.mfa_enabled = true;
        }
        if !self.mfa_enabled {
            self.totp_enabled = false;
            self.biometric_enabled = false;
            self.sms_enabled = false;
        }
        if !self.biometric_enabled {
            self.biometric_type = None;
        }
    }
}

/// A registered account. Credential material lives in a separate record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Stored lowercased; uniqueness is case-insensitive.
    pub email: String,
    pub display_name: String,
    pub created_at: u64,
    /// Set by the monitor's block action; a locked account cannot log in.
    pub locked: bool,
    pub settings: SecuritySettings,
}

/// What a signed token is good for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    /// Full API access.
    Full,
    /// Only valid for completing an MFA challenge.
    Mfa,
}

/// Claims carried inside a signed token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user_id: String,
    pub scope: TokenScope,
    pub issued_at: u64,
    pub expires_at: u64,
}

/// A full-access token plus its rotating refresh token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: u64,
}

/// Result of a successful password check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginOutcome {
    /// No MFA on the account — session tokens issued directly.
    Complete { user_id: String, tokens: TokenPair },
    /// MFA enabled — the caller must present a second factor within the
    /// token's 5-minute lifetime.
    MfaRequired { user_id: String, mfa_token: String },
}

struct RefreshEntry {
    user_id: String,
    expires_at: u64,
}

/// The authenticator. Holds the token-signing key for the process lifetime;
/// tokens do not survive a restart.
pub struct Authenticator {
    store: Arc<dyn SecureByteStore>,
    signing_key: SecretBytes<32>,
    refresh_tokens: HashMap<String, RefreshEntry>,
}

impl Authenticator {
    /// Create an authenticator with a fresh random token-signing key.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Crypto`] if the system RNG fails.
    pub fn new(store: Arc<dyn SecureByteStore>) -> Result<Self, GuardError> {
        Ok(Self {
            store,
            signing_key: SecretBytes::<32>::random()?,
            refresh_tokens: HashMap::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a new account.
    ///
    /// Policy check runs before any hashing. Email uniqueness is
    /// case-insensitive.
    ///
    /// # Errors
    ///
    /// - [`GuardError::Validation`] — malformed email
    /// - [`GuardError::Crypto`] with a weak-password reason
    /// - [`GuardError::DuplicateEmail`]
    pub fn register(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
        clock: &dyn Clock,
    ) -> Result<User, GuardError> {
        let email = normalize_email(email)?;
        password::validate_policy(password)?;

        if self.store.get(&ns_email(&email))?.is_some() {
            return Err(GuardError::DuplicateEmail);
        }

        let record = password::hash_password(password)?;
        let user = User {
            id: generate_uuid(),
            email: email.clone(),
            display_name: display_name.trim().to_owned(),
            created_at: clock.now_unix(),
            locked: false,
            settings: SecuritySettings::default(),
        };

        self.store
            .set(&ns_user(&user.id), &serde_json::to_vec(&user)?, false)?;
        self.store
            .set(&ns_credential(&user.id), &serde_json::to_vec(&record)?, false)?;
        self.store
            .set(&ns_email(&email), user.id.as_bytes(), false)?;

        debug!(user_id = %user.id, "registered account");
        Ok(user)
    }

    // -----------------------------------------------------------------------
    // Login / tokens
    // -----------------------------------------------------------------------

    /// Check a password and issue tokens.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidCredentials`] for unknown email, wrong
    /// password, and locked accounts alike.
    pub fn login(
        &mut self,
        email: &str,
        password: &str,
        clock: &dyn Clock,
    ) -> Result<LoginOutcome, GuardError> {
        let Some(user) = self.user_by_email(email)? else {
            // Burn the same KDF cost as a real verification so a missing
            // account is not observable through timing.
            let _ = password::hash_password(password);
            return Err(GuardError::InvalidCredentials);
        };

        let record = self.credential_record(&user.id)?;
        if !password::verify_password(password, &record)? {
            warn!(user_id = %user.id, "password verification failed");
            return Err(GuardError::InvalidCredentials);
        }
        if user.locked {
            warn!(user_id = %user.id, "login attempt on locked account");
            return Err(GuardError::InvalidCredentials);
        }

        if user.settings.mfa_enabled {
            let mfa_token = self.sign_token(&user.id, TokenScope::Mfa, clock)?;
            Ok(LoginOutcome::MfaRequired {
                user_id: user.id,
                mfa_token,
            })
        } else {
            let tokens = self.issue_token_pair(&user.id, clock)?;
            Ok(LoginOutcome::Complete {
                user_id: user.id,
                tokens,
            })
        }
    }

    /// Exchange a valid MFA-scoped token for a full token pair.
    ///
    /// The caller (the suite) is responsible for having verified the second
    /// factor first.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::TokenInvalid`] for wrong scope or bad
    /// signature, [`GuardError::TokenExpired`] past the 5-minute window.
    pub fn complete_mfa_login(
        &mut self,
        mfa_token: &str,
        clock: &dyn Clock,
    ) -> Result<(String, TokenPair), GuardError> {
        let claims = self.verify_token(mfa_token, clock)?;
        if claims.scope != TokenScope::Mfa {
            return Err(GuardError::TokenInvalid);
        }
        let tokens = self.issue_token_pair(&claims.user_id, clock)?;
        Ok((claims.user_id, tokens))
    }

    /// Mint a 5-minute MFA-scoped token outside the normal login flow.
    /// Used for monitor-driven step-up challenges.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Serialization`] on claim encoding failure.
    pub fn issue_mfa_challenge(
        &self,
        user_id: &str,
        clock: &dyn Clock,
    ) -> Result<String, GuardError> {
        self.sign_token(user_id, TokenScope::Mfa, clock)
    }

    /// Issue a fresh full-access pair for a user. Used after MFA completion
    /// and by the refresh flow.
    fn issue_token_pair(&mut self, user_id: &str, clock: &dyn Clock) -> Result<TokenPair, GuardError> {
        let now = clock.now_unix();
        let access_token = self.sign_token(user_id, TokenScope::Full, clock)?;
        let refresh_token = generate_opaque_token(REFRESH_TOKEN_LEN);
        self.refresh_tokens.insert(
            refresh_token.clone(),
            RefreshEntry {
                user_id: user_id.to_owned(),
                expires_at: now.saturating_add(REFRESH_TOKEN_TTL_SECS),
            },
        );
        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_at: now.saturating_add(ACCESS_TOKEN_TTL_SECS),
        })
    }

    /// Rotate a refresh token into a new token pair.
    ///
    /// The presented token is consumed whether or not it is still valid.
    ///
    /// # Errors
    ///
    /// - [`GuardError::TokenInvalid`] — unknown token
    /// - [`GuardError::TokenExpired`] — past the 30-day window
    pub fn refresh(&mut self, refresh_token: &str, clock: &dyn Clock) -> Result<TokenPair, GuardError> {
        let entry = self
            .refresh_tokens
            .remove(refresh_token)
            .ok_or(GuardError::TokenInvalid)?;
        if entry.expires_at <= clock.now_unix() {
            return Err(GuardError::TokenExpired);
        }
        self.issue_token_pair(&entry.user_id, clock)
    }

    /// Drop every refresh token for a user (logout-everywhere, block).
    pub fn revoke_refresh_tokens(&mut self, user_id: &str) {
        self.refresh_tokens.retain(|_, e| e.user_id != user_id);
    }

    /// Validate a signed token's signature and expiry.
    ///
    /// # Errors
    ///
    /// - [`GuardError::TokenInvalid`] — malformed or bad signature
    /// - [`GuardError::TokenExpired`]
    pub fn verify_token(&self, token: &str, clock: &dyn Clock) -> Result<TokenClaims, GuardError> {
        let (payload_b64, sig_b64) = token.split_once('.').ok_or(GuardError::TokenInvalid)?;
        let payload = BASE64URL_NOPAD
            .decode(payload_b64.as_bytes())
            .map_err(|_| GuardError::TokenInvalid)?;
        let signature = BASE64URL_NOPAD
            .decode(sig_b64.as_bytes())
            .map_err(|_| GuardError::TokenInvalid)?;

        let key = hmac::Key::new(hmac::HMAC_SHA256, self.signing_key.expose());
        hmac::verify(&key, &payload, &signature).map_err(|_| GuardError::TokenInvalid)?;

        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| GuardError::TokenInvalid)?;
        if claims.expires_at <= clock.now_unix() {
            return Err(GuardError::TokenExpired);
        }
        Ok(claims)
    }

    fn sign_token(
        &self,
        user_id: &str,
        scope: TokenScope,
        clock: &dyn Clock,
    ) -> Result<String, GuardError> {
        let now = clock.now_unix();
        let ttl = match scope {
            TokenScope::Full => ACCESS_TOKEN_TTL_SECS,
            TokenScope::Mfa => MFA_TOKEN_TTL_SECS,
        };
        let claims = TokenClaims {
            user_id: user_id.to_owned(),
            scope,
            issued_at: now,
            expires_at: now.saturating_add(ttl),
        };
        let payload = serde_json::to_vec(&claims)?;
        let key = hmac::Key::new(hmac::HMAC_SHA256, self.signing_key.expose());
        let tag = hmac::sign(&key, &payload);
        Ok(format!(
            "{}.{}",
            BASE64URL_NOPAD.encode(&payload),
            BASE64URL_NOPAD.encode(tag.as_ref())
        ))
    }

    // -----------------------------------------------------------------------
    // Password change
    // -----------------------------------------------------------------------

    /// Replace the credential record after verifying the current password.
    ///
    /// The record is replaced wholesale: new salt, new hash, current KDF
    /// parameters.
    ///
    /// # Errors
    ///
    /// - [`GuardError::InvalidCredentials`] — current password wrong
    /// - [`GuardError::Crypto`] — new password fails policy
    pub fn change_password(
        &self,
        user_id: &str,
        current: &str,
        new: &str,
    ) -> Result<(), GuardError> {
        let record = self.credential_record(user_id)?;
        if !password::verify_password(current, &record)? {
            return Err(GuardError::InvalidCredentials);
        }
        password::validate_policy(new)?;
        let fresh = password::hash_password(new)?;
        self.store
            .set(&ns_credential(user_id), &serde_json::to_vec(&fresh)?, false)?;
        debug!(user_id, "credential record replaced");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Settings / account state
    // -----------------------------------------------------------------------

    /// Update a user's security settings. The factor → `mfa_enabled`
    /// implication is normalized before persisting.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::UserNotFound`].
    pub fn update_settings(
        &self,
        user_id: &str,
        mut settings: SecuritySettings,
    ) -> Result<User, GuardError> {
        let mut user = self.require_user(user_id)?;
        settings.normalize();
        user.settings = settings;
        self.persist_user(&user)?;
        Ok(user)
    }

    /// Flip the TOTP flag (and with it `mfa_enabled`) after the MFA engine
    /// confirms possession of the enrolled secret.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::UserNotFound`].
    pub fn set_totp_enabled(&self, user_id: &str, enabled: bool) -> Result<User, GuardError> {
        let mut user = self.require_user(user_id)?;
        user.settings.totp_enabled = enabled;
        user.settings.normalize();
        self.persist_user(&user)?;
        Ok(user)
    }

    /// Record the outcome of biometric enrollment: `Some(modality)` after
    /// the gate enrolls, `None` when the enrollment is removed.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::UserNotFound`].
    pub fn set_biometric_enrollment(
        &self,
        user_id: &str,
        biometric_type: Option<BiometricType>,
    ) -> Result<User, GuardError> {
        let mut user = self.require_user(user_id)?;
        user.settings.biometric_enabled = biometric_type.is_some();
        user.settings.biometric_type = biometric_type;
        user.settings.normalize();
        self.persist_user(&user)?;
        Ok(user)
    }

    /// Lock an account (monitor block action). Locked accounts fail login
    /// with the same generic error as bad credentials.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::UserNotFound`].
    pub fn lock_user(&mut self, user_id: &str) -> Result<(), GuardError> {
        let mut user = self.require_user(user_id)?;
        user.locked = true;
        self.persist_user(&user)?;
        self.revoke_refresh_tokens(user_id);
        warn!(user_id, "account locked");
        Ok(())
    }

    /// Unlock a previously locked account.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::UserNotFound`].
    pub fn unlock_user(&self, user_id: &str) -> Result<(), GuardError> {
        let mut user = self.require_user(user_id)?;
        user.locked = false;
        self.persist_user(&user)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Fetch a user by id.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Store`] on backend failure.
    pub fn user_by_id(&self, user_id: &str) -> Result<Option<User>, GuardError> {
        match self.store.get(&ns_user(user_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch a user by email (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Store`] on backend failure.
    pub fn user_by_email(&self, email: &str) -> Result<Option<User>, GuardError> {
        let Ok(email) = normalize_email(email) else {
            return Ok(None);
        };
        let Some(id_bytes) = self.store.get(&ns_email(&email))? else {
            return Ok(None);
        };
        let user_id = String::from_utf8(id_bytes)
            .map_err(|_| GuardError::Store("corrupt email index".into()))?;
        self.user_by_id(&user_id)
    }

    fn require_user(&self, user_id: &str) -> Result<User, GuardError> {
        self.user_by_id(user_id)?
            .ok_or_else(|| GuardError::UserNotFound(user_id.to_owned()))
    }

    fn persist_user(&self, user: &User) -> Result<(), GuardError> {
        self.store
            .set(&ns_user(&user.id), &serde_json::to_vec(user)?, false)
    }

    fn credential_record(&self, user_id: &str) -> Result<PasswordRecord, GuardError> {
        let bytes = self
            .store
            .get(&ns_credential(user_id))?
            .ok_or(GuardError::InvalidCredentials)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Lowercase and shape-check an email address.
fn normalize_email(email: &str) -> Result<String, GuardError> {
    let email = email.trim().to_lowercase();
    let Some((local, domain)) = email.split_once('@') else {
        return Err(GuardError::Validation("email must contain '@'".into()));
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(GuardError::Validation("malformed email address".into()));
    }
    Ok(email)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
