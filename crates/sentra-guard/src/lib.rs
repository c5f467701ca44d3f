//! Sentra guard: credential, key-management, and monitoring logic.
//!
//! This crate layers the business rules on top of the pure primitives in
//! `sentra-crypto-core`:
//!
//! - [`keyring`] — master key, envelope encryption, key rotation
//! - [`authenticator`] — registration, login, tokens, settings
//! - [`mfa`] — TOTP enrollment, verification, backup codes
//! - [`biometric`] — platform abstraction and the gated-key unlock rule
//! - [`audit`] — fire-and-forget encrypted audit trail
//! - [`monitor`] — rule-driven threat detection and response actions
//! - [`session`] — idle-timeout session registry
//! - [`suite`] — the dependency-injection facade wiring it all together
//!
//! Everything is explicitly injected: the host supplies the byte store,
//! the clock, and the biometric platform. There are no globals, no
//! background threads, and no ambient time reads — schedules advance only
//! through `tick` calls.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod audit;
pub mod authenticator;
pub mod biometric;
pub mod clock;
pub mod error;
pub mod ids;
pub mod keyring;
pub mod mfa;
pub mod monitor;
pub mod session;
pub mod store;
pub mod suite;

pub use audit::{AuditEvent, AuditFamily, AuditKind, AuditQuery, AuditSummary, AuditTrail, Severity};
pub use authenticator::{
    Authenticator, LoginOutcome, SecuritySettings, TokenClaims, TokenPair, TokenScope, User,
};
pub use biometric::{BiometricCapability, BiometricGate, BiometricPlatform, BiometricType, PromptOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::GuardError;
pub use keyring::{EncryptedData, EncryptionKey, KeyRing};
pub use mfa::{MfaEngine, MfaOutcome, TotpProvisioning};
pub use monitor::{
    ActionKind, ActionStatus, ConditionOperator, MonitoringRule, RuleCondition, SecurityAction,
    SecurityMetrics, SecurityMonitor, SecurityThreat, ThreatKind, ThreatOutcome, ThreatStatus,
};
pub use session::{Session, SessionRegistry};
pub use store::{MemoryByteStore, SecureByteStore};
pub use suite::{LoginResponse, LoginSession, SecuritySuite, TickReport};
