//! Session registry with idle-timeout expiry.
//!
//! Sessions are opened after a completed login (including the MFA leg),
//! touched on activity, and reaped by [`SessionRegistry::tick`] — the
//! host calls it on its own cadence with the injected clock, so there is
//! no background timer anywhere in the core.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::error::GuardError;
use crate::ids::generate_uuid;

/// A live session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: u64,
    pub last_activity: u64,
    /// Idle timeout in seconds, from the user's settings at login time.
    pub idle_timeout_secs: u64,
    pub device: Option<String>,
}

impl Session {
    /// Whether the session has been idle past its timeout.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.last_activity) >= self.idle_timeout_secs
    }
}

/// In-memory session registry.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for a user.
    pub fn open(
        &mut self,
        user_id: &str,
        timeout_minutes: u32,
        device: Option<&str>,
        clock: &dyn Clock,
    ) -> Session {
        let now = clock.now_unix();
        let session = Session {
            id: generate_uuid(),
            user_id: user_id.to_owned(),
            created_at: now,
            last_activity: now,
            idle_timeout_secs: u64::from(timeout_minutes).saturating_mul(60),
            device: device.map(str::to_owned),
        };
        self.sessions.insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, user_id, "session opened");
        session
    }

    /// Record activity, resetting the idle timer.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Validation`] for an unknown or already
    /// expired session.
    pub fn touch(&mut self, session_id: &str, clock: &dyn Clock) -> Result<(), GuardError> {
        let now = clock.now_unix();
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| GuardError::Validation(format!("unknown session: {session_id}")))?;
        if session.is_expired(now) {
            return Err(GuardError::Validation("session expired".to_owned()));
        }
        session.last_activity = now;
        Ok(())
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Close one session. Closing a missing session is a no-op.
    pub fn close(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Close every session belonging to a user (logout-everywhere, lock).
    pub fn close_all_for_user(&mut self, user_id: &str) {
        self.sessions.retain(|_, s| s.user_id != user_id);
    }

    /// Reap idle sessions. Returns the expired ones; a no-op on an empty
    /// registry.
    pub fn tick(&mut self, clock: &dyn Clock) -> Vec<Session> {
        let now = clock.now_unix();
        let expired_ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id.clone())
            .collect();
        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(session) = self.sessions.remove(&id) {
                debug!(session_id = %session.id, "session expired");
                expired.push(session);
            }
        }
        expired
    }

    /// Number of live sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}
