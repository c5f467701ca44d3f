//! `SecuritySuite`: the explicit dependency-injection facade.
//!
//! Construction wires every component by hand — store, clock, and
//! biometric platform come in from the host, nothing is a global or a
//! singleton. The suite owns the event flow:
//!
//! ```text
//! auth / MFA / crypto ──► audit queue (fire-and-forget)
//!                   └───► monitor.analyze ──► actions ──► dispatch
//! ```
//!
//! Detection actions loop back into the suite: `block_user` locks the
//! account and drops its sessions, `alert_admin` records a security
//! event, `require_mfa` arms a step-up flag for the user's next login.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use sentra_crypto_core::memory::SecretBuffer;

use crate::audit::{
    AuditEvent, AuditKind, AuditQuery, AuditSummary, AuditTrail, Severity,
};
use crate::authenticator::{Authenticator, LoginOutcome, SecuritySettings, TokenPair, User};
use crate::biometric::{BiometricCapability, BiometricGate, BiometricPlatform, BiometricType};
use crate::clock::Clock;
use crate::error::GuardError;
use crate::keyring::{EncryptedData, EncryptionKey, KeyRing};
use crate::mfa::{MfaEngine, MfaOutcome, TotpProvisioning};
use crate::monitor::{
    ActionKind, SecurityAction, SecurityMetrics, SecurityMonitor, SecurityThreat, ThreatOutcome,
};
use crate::session::{Session, SessionRegistry};
use crate::store::SecureByteStore;

/// Stored envelopes migrated to the active key per maintenance tick.
const REWRAP_BATCH: usize = 16;

/// Store prefixes holding envelope-encrypted records, with the
/// user-presence gating their writes must preserve.
const ENVELOPE_PREFIXES: [(&str, bool); 3] =
    [("mfa/", false), ("biometric/", true), ("audit/", false)];

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A completed login: tokens plus an open session.
#[derive(Clone, Debug)]
pub struct LoginSession {
    pub user_id: String,
    pub tokens: TokenPair,
    pub session: Session,
}

/// Outcome of the password leg of a login.
#[derive(Clone, Debug)]
pub enum LoginResponse {
    /// Done — no second factor on the account.
    Complete(LoginSession),
    /// Present a second factor within the token's lifetime.
    MfaRequired { user_id: String, mfa_token: String },
}

/// What one maintenance tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub audit_events_persisted: usize,
    /// Stored envelopes moved from a retired key to the active one.
    pub envelopes_rewrapped: usize,
    pub sessions_expired: usize,
    pub rotated_key_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Suite
// ---------------------------------------------------------------------------

/// The wired security core.
pub struct SecuritySuite {
    clock: Arc<dyn Clock>,
    store: Arc<dyn SecureByteStore>,
    keyring: KeyRing,
    authenticator: Authenticator,
    mfa: MfaEngine,
    biometric: BiometricGate,
    audit: AuditTrail,
    monitor: SecurityMonitor,
    sessions: SessionRegistry,
    /// Users armed for step-up MFA by a `require_mfa` action.
    step_up: HashSet<String>,
}

impl SecuritySuite {
    /// Wire a suite from host-provided dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Crypto`] if the system RNG fails while
    /// creating the token-signing key.
    pub fn new(
        store: Arc<dyn SecureByteStore>,
        platform: Arc<dyn BiometricPlatform>,
        clock: Arc<dyn Clock>,
        issuer: impl Into<String>,
    ) -> Result<Self, GuardError> {
        Ok(Self {
            clock,
            keyring: KeyRing::new(store.clone()),
            authenticator: Authenticator::new(store.clone())?,
            mfa: MfaEngine::new(store.clone(), issuer),
            biometric: BiometricGate::new(store.clone(), platform),
            audit: AuditTrail::new(store.clone()),
            store,
            monitor: SecurityMonitor::new(),
            sessions: SessionRegistry::new(),
            step_up: HashSet::new(),
        })
    }

    /// Derive the master key and load persisted state.
    ///
    /// # Errors
    ///
    /// Propagates key-manager initialization failures.
    pub fn initialize(&mut self, user_secret: Option<&[u8]>) -> Result<(), GuardError> {
        self.keyring.initialize(user_secret, &*self.clock)
    }

    // -----------------------------------------------------------------------
    // Accounts / login
    // -----------------------------------------------------------------------

    /// Register an account.
    ///
    /// # Errors
    ///
    /// See [`Authenticator::register`].
    pub fn register(
        &mut self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<User, GuardError> {
        let user = self
            .authenticator
            .register(email, password, display_name, &*self.clock)?;
        let event = AuditEvent::new(
            AuditKind::UserActivity {
                action: "register".to_owned(),
                success: true,
                duration_ms: 0,
            },
            &*self.clock,
        )
        .with_user(user.id.clone());
        self.record(event);
        Ok(user)
    }

    /// Password leg of a login.
    ///
    /// Every failure is recorded as a `login_failed` security event and
    /// fed to the monitor before the generic error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidCredentials`] on any failure.
    pub fn login(
        &mut self,
        email: &str,
        password: &str,
        device: Option<&str>,
    ) -> Result<LoginResponse, GuardError> {
        let outcome = match self.authenticator.login(email, password, &*self.clock) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_login_failure(email, device);
                return Err(e);
            }
        };

        match outcome {
            LoginOutcome::MfaRequired { user_id, mfa_token } => {
                Ok(LoginResponse::MfaRequired { user_id, mfa_token })
            }
            LoginOutcome::Complete { user_id, tokens } => {
                // A step-up flag forces the second factor even though the
                // account normally skips it. Without an enrollment there
                // is nothing to step up into; the flag stays armed.
                if self.step_up.contains(&user_id)
                    && self.mfa.is_enrolled(&user_id, &self.keyring)?
                {
                    warn!(user_id = %user_id, "step-up MFA enforced");
                    self.authenticator.revoke_refresh_tokens(&user_id);
                    let mfa_token = self
                        .authenticator
                        .issue_mfa_challenge(&user_id, &*self.clock)?;
                    return Ok(LoginResponse::MfaRequired { user_id, mfa_token });
                }
                let session = self.open_session(&user_id, device)?;
                Ok(LoginResponse::Complete(LoginSession {
                    user_id,
                    tokens,
                    session,
                }))
            }
        }
    }

    /// Second-factor leg: verify a TOTP or backup code against the MFA
    /// token from [`login`](Self::login).
    ///
    /// # Errors
    ///
    /// - token errors from [`Authenticator::verify_token`]
    /// - [`GuardError::InvalidCredentials`] — code rejected
    pub fn verify_totp(
        &mut self,
        mfa_token: &str,
        code: &str,
        device: Option<&str>,
    ) -> Result<LoginSession, GuardError> {
        let claims = self.authenticator.verify_token(mfa_token, &*self.clock)?;
        let outcome = self
            .mfa
            .verify(&claims.user_id, code, &self.keyring, &*self.clock)?;

        if !outcome.is_success() {
            let mut event = self.security_event("mfa_failed", Severity::Medium, 50, &claims.user_id);
            if let Some(device) = device {
                event = event.with_device(device);
            }
            self.record(event);
            return Err(GuardError::InvalidCredentials);
        }
        if let MfaOutcome::Backup { remaining } = outcome {
            let mut details = BTreeMap::new();
            details.insert("remaining_backup_codes".to_owned(), remaining.to_string());
            let event = AuditEvent::new(
                AuditKind::Security {
                    event_type: "backup_code_used".to_owned(),
                    severity: Severity::Medium,
                    risk_score: 30,
                    details,
                },
                &*self.clock,
            )
            .with_user(claims.user_id.clone());
            self.record(event);
        }

        let (user_id, tokens) = self.authenticator.complete_mfa_login(mfa_token, &*self.clock)?;
        self.step_up.remove(&user_id);
        let session = self.open_session(&user_id, device)?;
        Ok(LoginSession {
            user_id,
            tokens,
            session,
        })
    }

    fn open_session(
        &mut self,
        user_id: &str,
        device: Option<&str>,
    ) -> Result<Session, GuardError> {
        let timeout = self
            .authenticator
            .user_by_id(user_id)?
            .map_or(30, |u| u.settings.session_timeout_minutes);
        let session = self.sessions.open(user_id, timeout, device, &*self.clock);

        let mut event = AuditEvent::new(
            AuditKind::UserActivity {
                action: "login".to_owned(),
                success: true,
                duration_ms: 0,
            },
            &*self.clock,
        )
        .with_user(user_id)
        .with_session(session.id.clone());
        if let Some(device) = device {
            event = event.with_device(device);
        }
        self.record(event);
        Ok(session)
    }

    fn record_login_failure(&mut self, email: &str, device: Option<&str>) {
        // Failures attribute to the account when the email resolves; a
        // miss still gets logged without a user id.
        let user_id = self
            .authenticator
            .user_by_email(email)
            .ok()
            .flatten()
            .map(|u| u.id);
        let mut details = BTreeMap::new();
        details.insert("email".to_owned(), email.trim().to_lowercase());
        let mut event = AuditEvent::new(
            AuditKind::Security {
                event_type: "login_failed".to_owned(),
                severity: Severity::Medium,
                risk_score: 40,
                details,
            },
            &*self.clock,
        );
        if let Some(user_id) = user_id {
            event = event.with_user(user_id);
        }
        if let Some(device) = device {
            event = event.with_device(device);
        }
        self.record(event);
    }

    /// Rotate a refresh token.
    ///
    /// # Errors
    ///
    /// See [`Authenticator::refresh`].
    pub fn refresh(&mut self, refresh_token: &str) -> Result<TokenPair, GuardError> {
        self.authenticator.refresh(refresh_token, &*self.clock)
    }

    /// Validate an access token.
    ///
    /// # Errors
    ///
    /// See [`Authenticator::verify_token`].
    pub fn verify_token(
        &self,
        token: &str,
    ) -> Result<crate::authenticator::TokenClaims, GuardError> {
        self.authenticator.verify_token(token, &*self.clock)
    }

    /// Change a password, auditing the outcome.
    ///
    /// # Errors
    ///
    /// See [`Authenticator::change_password`].
    pub fn change_password(
        &mut self,
        user_id: &str,
        current: &str,
        new: &str,
    ) -> Result<(), GuardError> {
        let result = self.authenticator.change_password(user_id, current, new);
        let event = self
            .security_event(
                "password_changed",
                Severity::Low,
                10,
                user_id,
            );
        match &result {
            Ok(()) => self.record(event),
            Err(_) => {
                let failed = self.security_event("password_change_failed", Severity::Medium, 40, user_id);
                self.record(failed);
            }
        }
        result
    }

    /// Update security settings.
    ///
    /// # Errors
    ///
    /// See [`Authenticator::update_settings`].
    pub fn update_settings(
        &mut self,
        user_id: &str,
        settings: SecuritySettings,
    ) -> Result<User, GuardError> {
        self.authenticator.update_settings(user_id, settings)
    }

    /// Look up a user by id.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn user(&self, user_id: &str) -> Result<Option<User>, GuardError> {
        self.authenticator.user_by_id(user_id)
    }

    /// Whether a `require_mfa` action is armed for this user.
    #[must_use]
    pub fn requires_step_up(&self, user_id: &str) -> bool {
        self.step_up.contains(user_id)
    }

    // -----------------------------------------------------------------------
    // MFA
    // -----------------------------------------------------------------------

    /// Begin TOTP enrollment for a user.
    ///
    /// # Errors
    ///
    /// See [`MfaEngine::setup_totp`]; unknown users are rejected.
    pub fn setup_totp(&mut self, user_id: &str) -> Result<TotpProvisioning, GuardError> {
        let user = self
            .authenticator
            .user_by_id(user_id)?
            .ok_or_else(|| GuardError::UserNotFound(user_id.to_owned()))?;
        self.mfa
            .setup_totp(user_id, &user.email, &self.keyring, &*self.clock)
    }

    /// Confirm enrollment with a live code; flips the account's TOTP and
    /// MFA flags on success.
    ///
    /// # Errors
    ///
    /// See [`MfaEngine::complete_setup`].
    pub fn confirm_totp(&mut self, user_id: &str, code: &str) -> Result<bool, GuardError> {
        let confirmed = self
            .mfa
            .complete_setup(user_id, code, &self.keyring, &*self.clock)?;
        if confirmed {
            self.authenticator.set_totp_enabled(user_id, true)?;
            let event = self.security_event("mfa_enabled", Severity::Low, 5, user_id);
            self.record(event);
        }
        Ok(confirmed)
    }

    // -----------------------------------------------------------------------
    // Biometric
    // -----------------------------------------------------------------------

    /// Platform capability snapshot.
    #[must_use]
    pub fn biometric_availability(&self) -> BiometricCapability {
        self.biometric.check_availability()
    }

    /// Enroll biometric unlock. On success the account records the enabled
    /// flag and the enrolled modality; cancellation returns `None`.
    ///
    /// # Errors
    ///
    /// See [`BiometricGate::setup`].
    pub fn setup_biometric(
        &mut self,
        user_id: &str,
    ) -> Result<Option<BiometricType>, GuardError> {
        let enrolled = self.biometric.setup(user_id, &self.keyring, &*self.clock)?;
        if let Some(biometric_type) = enrolled {
            self.authenticator
                .set_biometric_enrollment(user_id, Some(biometric_type))?;
            let event = self.security_event("biometric_enabled", Severity::Low, 5, user_id);
            self.record(event);
        }
        Ok(enrolled)
    }

    /// Biometric authentication. Cancellation and soft failures return
    /// `false`.
    ///
    /// # Errors
    ///
    /// See [`BiometricGate::authenticate`].
    pub fn authenticate_biometric(
        &mut self,
        user_id: &str,
        reason: &str,
    ) -> Result<bool, GuardError> {
        let passed = self.biometric.authenticate(user_id, reason, &self.keyring)?;
        if !passed {
            let event = self.security_event("biometric_failed", Severity::Low, 20, user_id);
            self.record(event);
        }
        Ok(passed)
    }

    // -----------------------------------------------------------------------
    // Data protection
    // -----------------------------------------------------------------------

    /// Encrypt application data under the active key.
    ///
    /// # Errors
    ///
    /// See [`KeyRing::encrypt`].
    pub fn encrypt_data(&self, plaintext: &[u8]) -> Result<EncryptedData, GuardError> {
        self.keyring.encrypt(plaintext, None, &*self.clock)
    }

    /// Decrypt an envelope. An integrity failure raises a critical
    /// security event before the error surfaces.
    ///
    /// # Errors
    ///
    /// See [`KeyRing::decrypt`].
    pub fn decrypt_data(&mut self, data: &EncryptedData) -> Result<SecretBuffer, GuardError> {
        match self.keyring.decrypt(data) {
            Ok(plaintext) => Ok(plaintext),
            Err(GuardError::Integrity) => {
                let mut details = BTreeMap::new();
                details.insert("key_id".to_owned(), data.key_id.clone());
                let event = AuditEvent::new(
                    AuditKind::Security {
                        event_type: "integrity_failure".to_owned(),
                        severity: Severity::Critical,
                        risk_score: 95,
                        details,
                    },
                    &*self.clock,
                );
                self.record(event);
                Err(GuardError::Integrity)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-encrypt an envelope under the active key.
    ///
    /// # Errors
    ///
    /// See [`KeyRing::reencrypt`].
    pub fn reencrypt_data(&self, data: &EncryptedData) -> Result<EncryptedData, GuardError> {
        self.keyring.reencrypt(data, &*self.clock)
    }

    /// Rotate the active encryption key now. Stored envelopes under the
    /// retired keys migrate to the new key over subsequent maintenance
    /// ticks; until then they stay decryptable as-is.
    ///
    /// # Errors
    ///
    /// See [`KeyRing::rotate`].
    pub fn rotate_keys(&mut self, reason: &str) -> Result<EncryptionKey, GuardError> {
        let key = self.keyring.rotate(reason, &*self.clock)?;
        let mut details = BTreeMap::new();
        details.insert("new_key_id".to_owned(), key.id.clone());
        details.insert("reason".to_owned(), reason.to_owned());
        let event = AuditEvent::new(
            AuditKind::Security {
                event_type: "key_rotated".to_owned(),
                severity: Severity::Low,
                risk_score: 5,
                details,
            },
            &*self.clock,
        );
        self.record(event);
        Ok(key)
    }

    /// Loaded key metadata, active and retained.
    #[must_use]
    pub fn encryption_keys(&self) -> Vec<EncryptionKey> {
        self.keyring.keys()
    }

    // -----------------------------------------------------------------------
    // Audit / monitor surface
    // -----------------------------------------------------------------------

    /// Record an application activity event.
    pub fn log_user_activity(
        &mut self,
        user_id: &str,
        action: &str,
        success: bool,
        duration_ms: u64,
    ) {
        let event = AuditEvent::new(
            AuditKind::UserActivity {
                action: action.to_owned(),
                success,
                duration_ms,
            },
            &*self.clock,
        )
        .with_user(user_id);
        self.record(event);
    }

    /// Query persisted audit events.
    ///
    /// # Errors
    ///
    /// See [`AuditTrail::query`].
    pub fn audit_events(&self, filter: &AuditQuery) -> Result<Vec<AuditEvent>, GuardError> {
        self.audit.query(filter, &self.keyring)
    }

    /// Summarize persisted audit events.
    ///
    /// # Errors
    ///
    /// See [`AuditTrail::summarize`].
    pub fn audit_summary(&self, window_days: u64) -> Result<AuditSummary, GuardError> {
        self.audit.summarize(window_days, &self.keyring, &*self.clock)
    }

    /// Non-terminal threats, newest first.
    #[must_use]
    pub fn active_threats(&self) -> Vec<SecurityThreat> {
        self.monitor.active_threats()
    }

    /// Close a threat.
    ///
    /// # Errors
    ///
    /// See [`SecurityMonitor::resolve`].
    pub fn resolve_threat(
        &mut self,
        threat_id: &str,
        outcome: ThreatOutcome,
    ) -> Result<(), GuardError> {
        self.monitor.resolve(threat_id, outcome, &*self.clock)
    }

    /// Detection counters over a trailing window.
    #[must_use]
    pub fn security_metrics(&self, window_days: u64) -> SecurityMetrics {
        self.monitor.metrics(window_days, &*self.clock)
    }

    /// Unlock a previously blocked account.
    ///
    /// # Errors
    ///
    /// See [`Authenticator::unlock_user`].
    pub fn unlock_user(&mut self, user_id: &str) -> Result<(), GuardError> {
        self.authenticator.unlock_user(user_id)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// One host-driven maintenance tick: flush an audit batch, migrate a
    /// batch of stale envelopes to the active key, reap idle sessions,
    /// check the rotation schedule.
    ///
    /// Audit flush and migration failures are absorbed (the queue retains
    /// its events, stale envelopes stay decryptable under retained keys);
    /// rotation failures propagate.
    ///
    /// # Errors
    ///
    /// Propagates rotation failures.
    pub fn tick(&mut self) -> Result<TickReport, GuardError> {
        let audit_events_persisted = match self.audit.flush_batch(&self.keyring, &*self.clock) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "audit flush deferred");
                0
            }
        };
        let envelopes_rewrapped = match self.rewrap_batch() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "envelope migration deferred");
                0
            }
        };
        let sessions_expired = self.sessions.tick(&*self.clock).len();
        let rotated_key_id = self
            .keyring
            .rotation_tick(&*self.clock)?
            .map(|key| key.id);
        if let Some(key_id) = &rotated_key_id {
            info!(key_id = %key_id, "scheduled rotation performed");
        }
        Ok(TickReport {
            audit_events_persisted,
            envelopes_rewrapped,
            sessions_expired,
            rotated_key_id,
        })
    }

    /// Re-encrypt up to [`REWRAP_BATCH`] stored envelopes whose key is no
    /// longer the active one. A no-op when everything is current.
    ///
    /// Presence-gated entries that cannot be read are left for a later
    /// pass, after a platform prompt has raised the latch.
    fn rewrap_batch(&self) -> Result<usize, GuardError> {
        let Some(active) = self.keyring.active_key() else {
            return Ok(0);
        };
        let active_id = active.id.clone();
        let mut rewrapped = 0usize;

        for (prefix, gated) in ENVELOPE_PREFIXES {
            for key in self.store.list(prefix)? {
                if rewrapped >= REWRAP_BATCH {
                    return Ok(rewrapped);
                }
                let bytes = match self.store.get(&key) {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => continue,
                    Err(GuardError::UserPresenceRequired(_)) => continue,
                    Err(e) => return Err(e),
                };
                let envelope: EncryptedData = serde_json::from_slice(&bytes)?;
                if envelope.key_id == active_id {
                    continue;
                }
                let migrated = self.keyring.reencrypt(&envelope, &*self.clock)?;
                self.store.set(&key, &serde_json::to_vec(&migrated)?, gated)?;
                rewrapped = rewrapped.saturating_add(1);
            }
        }
        if rewrapped > 0 {
            info!(rewrapped, "migrated envelopes to the active key");
        }
        Ok(rewrapped)
    }

    /// Pending audit events not yet persisted.
    #[must_use]
    pub fn audit_queue_len(&self) -> usize {
        self.audit.queue_len()
    }

    /// Live session count.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.active_count()
    }

    // -----------------------------------------------------------------------
    // Event plumbing
    // -----------------------------------------------------------------------

    /// Queue an event for the audit trail and feed it to the monitor,
    /// dispatching whatever actions detection produces.
    fn record(&mut self, event: AuditEvent) {
        self.audit.log(event.clone());
        let actions = self.monitor.analyze(&event, &*self.clock);
        self.dispatch(actions);
    }

    fn dispatch(&mut self, actions: Vec<SecurityAction>) {
        for action in actions {
            let success = match action.kind {
                ActionKind::BlockUser => {
                    let locked = self.authenticator.lock_user(&action.user_id).is_ok();
                    self.sessions.close_all_for_user(&action.user_id);
                    locked
                }
                ActionKind::AlertAdmin => {
                    let mut details = BTreeMap::new();
                    details.insert("threat_id".to_owned(), action.threat_id.clone());
                    // Straight to the queue; alerts are not re-analyzed.
                    self.audit.log(
                        AuditEvent::new(
                            AuditKind::Security {
                                event_type: "admin_alert".to_owned(),
                                severity: Severity::High,
                                risk_score: 80,
                                details,
                            },
                            &*self.clock,
                        )
                        .with_user(action.user_id.clone()),
                    );
                    true
                }
                ActionKind::RequireMfa => {
                    self.step_up.insert(action.user_id.clone());
                    true
                }
            };
            if let Err(e) = self.monitor.complete_action(&action.id, success, &*self.clock) {
                warn!(action_id = %action.id, error = %e, "action completion not recorded");
            }
        }
    }

    fn security_event(
        &self,
        event_type: &str,
        severity: Severity,
        risk_score: u8,
        user_id: &str,
    ) -> AuditEvent {
        AuditEvent::new(
            AuditKind::Security {
                event_type: event_type.to_owned(),
                severity,
                risk_score,
                details: BTreeMap::new(),
            },
            &*self.clock,
        )
        .with_user(user_id)
    }
}
