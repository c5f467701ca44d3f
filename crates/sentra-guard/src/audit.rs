//! Audit trail: fire-and-forget event capture, encrypted persistence, and
//! query/summary reads.
//!
//! `log` never blocks and never fails — events land in an in-memory queue
//! and the host drains them on its own cadence. A drain processes batches
//! of [`BATCH_SIZE`], envelope-encrypting each record before it touches
//! the byte store. A persistence failure leaves the unpersisted tail in
//! the queue and bumps a failure counter; nothing is dropped.
//!
//! Persisted records are keyed `audit/<timestamp>-<seq>` with zero-padded
//! fields, so lexicographic key order is chronological order and queries
//! read newest-first by walking the listing backwards.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::GuardError;
use crate::ids::generate_uuid;
use crate::keyring::{EncryptedData, KeyRing};
use crate::store::{ns_audit, SecureByteStore};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Events persisted per drain batch.
pub const BATCH_SIZE: usize = 10;

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// Event severity, ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Stable lowercase label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// System-event level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemLevel {
    Info,
    Warning,
    Error,
}

/// Event family discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditFamily {
    Security,
    UserActivity,
    System,
}

impl AuditFamily {
    /// Stable lowercase label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::UserActivity => "user_activity",
            Self::System => "system",
        }
    }
}

/// Family-specific payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum AuditKind {
    Security {
        /// Machine-readable type, e.g. `login_failed`.
        event_type: String,
        severity: Severity,
        /// 0–100.
        risk_score: u8,
        details: BTreeMap<String, String>,
    },
    UserActivity {
        action: String,
        success: bool,
        duration_ms: u64,
    },
    System {
        level: SystemLevel,
        component: String,
        error: Option<String>,
    },
}

impl AuditKind {
    /// Discriminant of this payload.
    #[must_use]
    pub const fn family(&self) -> AuditFamily {
        match self {
            Self::Security { .. } => AuditFamily::Security,
            Self::UserActivity { .. } => AuditFamily::UserActivity,
            Self::System { .. } => AuditFamily::System,
        }
    }
}

/// One audit record: common header plus family payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: u64,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub device: Option<String>,
    #[serde(flatten)]
    pub kind: AuditKind,
}

impl AuditEvent {
    /// New event stamped with the given clock.
    #[must_use]
    pub fn new(kind: AuditKind, clock: &dyn Clock) -> Self {
        Self {
            id: generate_uuid(),
            timestamp: clock.now_unix(),
            user_id: None,
            session_id: None,
            device: None,
            kind,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Query / summary
// ---------------------------------------------------------------------------

/// Filter for [`AuditTrail::query`]. Defaults select everything.
#[derive(Clone, Debug, Default)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub family: Option<AuditFamily>,
    /// Inclusive lower timestamp bound.
    pub since: Option<u64>,
    /// Exclusive upper timestamp bound.
    pub until: Option<u64>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(user_id) = &self.user_id {
            if event.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(family) = self.family {
            if event.kind.family() != family {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp >= until {
                return false;
            }
        }
        true
    }
}

/// Aggregate view over a time window.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AuditSummary {
    pub total: usize,
    pub by_family: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    /// Event types of Security events, most frequent first, top 5.
    pub top_event_types: Vec<(String, usize)>,
    /// Mean risk score over Security events; 0.0 when there are none.
    pub mean_risk_score: f64,
}

// ---------------------------------------------------------------------------
// Trail
// ---------------------------------------------------------------------------

/// The audit trail.
pub struct AuditTrail {
    store: Arc<dyn SecureByteStore>,
    queue: Mutex<VecDeque<AuditEvent>>,
    /// Monotonic persistence sequence; keeps within-batch order stable in
    /// the key space even when timestamps collide.
    seq: AtomicU64,
    failed_flushes: AtomicU64,
}

impl AuditTrail {
    #[must_use]
    pub fn new(store: Arc<dyn SecureByteStore>) -> Self {
        Self {
            store,
            queue: Mutex::new(VecDeque::new()),
            seq: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
        }
    }

    /// Enqueue an event. Fire-and-forget: never blocks on I/O, never
    /// fails, never propagates anything to the triggering action.
    pub fn log(&self, event: AuditEvent) {
        self.queue.lock().push_back(event);
    }

    /// Events waiting to be persisted.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Count of drain batches that hit a persistence failure.
    #[must_use]
    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes.load(Ordering::SeqCst)
    }

    /// Persist one batch of up to [`BATCH_SIZE`] events, oldest first.
    ///
    /// Each event is envelope-encrypted through the key manager. On a
    /// failure mid-batch the unpersisted remainder goes back to the front
    /// of the queue in its original order.
    ///
    /// Returns the number of events persisted.
    ///
    /// # Errors
    ///
    /// Returns the underlying failure after re-queueing; events already
    /// persisted in this batch stay persisted.
    pub fn flush_batch(&self, keyring: &KeyRing, clock: &dyn Clock) -> Result<usize, GuardError> {
        let mut batch: Vec<AuditEvent> = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(BATCH_SIZE);
            queue.drain(..take).collect()
        };

        let mut persisted = 0usize;
        while !batch.is_empty() {
            let event = batch.remove(0);
            if let Err(e) = self.persist_event(&event, keyring, clock) {
                // Put the failed event and the rest of the batch back in
                // front, preserving order.
                let mut queue = self.queue.lock();
                queue.push_front(event);
                for ev in batch.into_iter().rev() {
                    queue.push_front(ev);
                }
                self.failed_flushes.fetch_add(1, Ordering::SeqCst);
                warn!(error = %e, "audit flush failed; events retained");
                return Err(e);
            }
            persisted = persisted.saturating_add(1);
        }

        if persisted > 0 {
            debug!(persisted, "audit batch persisted");
        }
        Ok(persisted)
    }

    /// Drain the whole queue, batch by batch.
    ///
    /// # Errors
    ///
    /// Stops at the first failing batch; the remainder stays queued.
    pub fn drain(&self, keyring: &KeyRing, clock: &dyn Clock) -> Result<usize, GuardError> {
        let mut total = 0usize;
        loop {
            if self.queue.lock().is_empty() {
                return Ok(total);
            }
            total = total.saturating_add(self.flush_batch(keyring, clock)?);
        }
    }

    fn persist_event(
        &self,
        event: &AuditEvent,
        keyring: &KeyRing,
        clock: &dyn Clock,
    ) -> Result<(), GuardError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let log_id = format!("{:012}-{seq:08}", event.timestamp);
        let plaintext = serde_json::to_vec(event)?;
        let envelope = keyring.encrypt(&plaintext, None, clock)?;
        self.store
            .set(&ns_audit(&log_id), &serde_json::to_vec(&envelope)?, false)
    }

    /// Query persisted events, newest first, with offset/limit paging.
    ///
    /// Queued-but-unflushed events are not visible; callers drain first if
    /// they need read-your-writes.
    ///
    /// # Errors
    ///
    /// Propagates store/decrypt failures. A corrupt record fails the
    /// query rather than being silently skipped.
    pub fn query(&self, filter: &AuditQuery, keyring: &KeyRing) -> Result<Vec<AuditEvent>, GuardError> {
        let keys = self.store.list("audit/")?;
        let mut out = Vec::new();
        let mut skipped = 0usize;

        // Listing is lexicographic = chronological; walk backwards.
        for key in keys.iter().rev() {
            let Some(bytes) = self.store.get(key)? else {
                continue;
            };
            let envelope: EncryptedData = serde_json::from_slice(&bytes)?;
            let plaintext = keyring.decrypt(&envelope)?;
            let event: AuditEvent = serde_json::from_slice(plaintext.expose())?;
            if !filter.matches(&event) {
                continue;
            }
            if skipped < filter.offset {
                skipped = skipped.saturating_add(1);
                continue;
            }
            out.push(event);
            if let Some(limit) = filter.limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Aggregate persisted events over the trailing `window_days`.
    ///
    /// # Errors
    ///
    /// Propagates query failures.
    pub fn summarize(
        &self,
        window_days: u64,
        keyring: &KeyRing,
        clock: &dyn Clock,
    ) -> Result<AuditSummary, GuardError> {
        let now = clock.now_unix();
        let since = now.saturating_sub(window_days.saturating_mul(86_400));
        let events = self.query(
            &AuditQuery {
                since: Some(since),
                ..AuditQuery::default()
            },
            keyring,
        )?;

        let mut summary = AuditSummary {
            total: events.len(),
            ..AuditSummary::default()
        };
        let mut type_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut risk_sum = 0u64;
        let mut risk_count = 0u64;

        for event in &events {
            bump(&mut summary.by_family, event.kind.family().label());
            if let AuditKind::Security {
                event_type,
                severity,
                risk_score,
                ..
            } = &event.kind
            {
                bump(&mut summary.by_severity, severity.label());
                bump(&mut type_counts, event_type);
                risk_sum = risk_sum.saturating_add(u64::from(*risk_score));
                risk_count = risk_count.saturating_add(1);
            }
        }

        let mut top: Vec<(String, usize)> = type_counts.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(5);
        summary.top_event_types = top;

        if risk_count > 0 {
            // Float division; both operands fit in f64 exactly for any
            // realistic event count.
            #[allow(clippy::cast_precision_loss)]
            {
                summary.mean_risk_score = risk_sum as f64 / risk_count as f64;
            }
        }
        Ok(summary)
    }
}

fn bump(map: &mut BTreeMap<String, usize>, key: &str) {
    let counter = map.entry(key.to_owned()).or_insert(0);
    *counter = counter.saturating_add(1);
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryByteStore;

    const T0: u64 = 1_700_000_000;

    fn setup() -> (AuditTrail, KeyRing, ManualClock, Arc<MemoryByteStore>) {
        let store: Arc<MemoryByteStore> = Arc::new(MemoryByteStore::new());
        let clock = ManualClock::new(T0);
        let mut keyring = KeyRing::new(store.clone());
        keyring.initialize(Some(b"pw"), &clock).expect("keyring");
        (AuditTrail::new(store.clone()), keyring, clock, store)
    }

    fn security_event(clock: &dyn Clock, event_type: &str, risk: u8) -> AuditEvent {
        AuditEvent::new(
            AuditKind::Security {
                event_type: event_type.to_owned(),
                severity: Severity::High,
                risk_score: risk,
                details: BTreeMap::new(),
            },
            clock,
        )
        .with_user("u1")
    }

    fn activity_event(clock: &dyn Clock, action: &str) -> AuditEvent {
        AuditEvent::new(
            AuditKind::UserActivity {
                action: action.to_owned(),
                success: true,
                duration_ms: 12,
            },
            clock,
        )
        .with_user("u1")
    }

    #[test]
    fn log_is_fire_and_forget() {
        let (trail, _keyring, clock, store) = setup();
        // Even with a broken store, logging succeeds.
        store.set_fail_writes(true);
        trail.log(activity_event(&clock, "open_vault"));
        assert_eq!(trail.queue_len(), 1);
    }

    #[test]
    fn flush_persists_batch_of_ten() {
        let (trail, keyring, clock, _store) = setup();
        for i in 0..25 {
            trail.log(activity_event(&clock, &format!("action-{i}")));
        }
        assert_eq!(trail.flush_batch(&keyring, &clock).expect("flush"), 10);
        assert_eq!(trail.queue_len(), 15);
        assert_eq!(trail.drain(&keyring, &clock).expect("drain"), 15);
        assert_eq!(trail.queue_len(), 0);
    }

    #[test]
    fn flush_failure_retains_queue_and_counts() {
        let (trail, keyring, clock, store) = setup();
        for i in 0..3 {
            trail.log(activity_event(&clock, &format!("action-{i}")));
        }

        store.set_fail_writes(true);
        assert!(trail.flush_batch(&keyring, &clock).is_err());
        assert_eq!(trail.queue_len(), 3, "no events lost on failure");
        assert_eq!(trail.failed_flushes(), 1);

        store.set_fail_writes(false);
        assert_eq!(trail.drain(&keyring, &clock).expect("drain"), 3);

        // Order survived the failed attempt.
        let events = trail.query(&AuditQuery::default(), &keyring).expect("query");
        let actions: Vec<String> = events
            .iter()
            .filter_map(|e| match &e.kind {
                AuditKind::UserActivity { action, .. } => Some(action.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(actions, vec!["action-2", "action-1", "action-0"]);
    }

    #[test]
    fn records_are_encrypted_at_rest() {
        let (trail, keyring, clock, store) = setup();
        trail.log(activity_event(&clock, "very-distinctive-action-name"));
        trail.drain(&keyring, &clock).expect("drain");

        use crate::store::SecureByteStore as _;
        let keys = store.list("audit/").expect("list");
        assert_eq!(keys.len(), 1);
        let raw = store.get(&keys[0]).expect("get").expect("present");
        assert!(!String::from_utf8_lossy(&raw).contains("very-distinctive-action-name"));
    }

    #[test]
    fn query_is_newest_first() {
        let (trail, keyring, clock, _store) = setup();
        trail.log(security_event(&clock, "e1", 10));
        clock.advance(60);
        trail.log(security_event(&clock, "e2", 20));
        trail.drain(&keyring, &clock).expect("drain");

        let events = trail.query(&AuditQuery::default(), &keyring).expect("query");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, T0 + 60);
        assert_eq!(events[1].timestamp, T0);
    }

    #[test]
    fn query_offset_and_limit() {
        let (trail, keyring, clock, _store) = setup();
        for i in 0..5 {
            trail.log(activity_event(&clock, &format!("a{i}")));
            clock.advance(1);
        }
        trail.drain(&keyring, &clock).expect("drain");

        let page = trail
            .query(
                &AuditQuery {
                    offset: 1,
                    limit: Some(2),
                    ..AuditQuery::default()
                },
                &keyring,
            )
            .expect("query");
        assert_eq!(page.len(), 2);
        // Newest is skipped by the offset.
        assert_eq!(page[0].timestamp, T0 + 3);
        assert_eq!(page[1].timestamp, T0 + 2);
    }

    #[test]
    fn query_filters_by_family_and_user() {
        let (trail, keyring, clock, _store) = setup();
        trail.log(security_event(&clock, "login_failed", 40));
        trail.log(activity_event(&clock, "open"));
        trail.log(
            AuditEvent::new(
                AuditKind::System {
                    level: SystemLevel::Error,
                    component: "store".into(),
                    error: Some("disk full".into()),
                },
                &clock,
            ),
        );
        trail.drain(&keyring, &clock).expect("drain");

        let security = trail
            .query(
                &AuditQuery {
                    family: Some(AuditFamily::Security),
                    ..AuditQuery::default()
                },
                &keyring,
            )
            .expect("query");
        assert_eq!(security.len(), 1);

        let for_user = trail
            .query(
                &AuditQuery {
                    user_id: Some("u1".into()),
                    ..AuditQuery::default()
                },
                &keyring,
            )
            .expect("query");
        assert_eq!(for_user.len(), 2);
    }

    #[test]
    fn within_batch_order_is_preserved() {
        let (trail, keyring, clock, _store) = setup();
        // Same timestamp for all; the sequence must disambiguate.
        for i in 0..10 {
            trail.log(activity_event(&clock, &format!("step-{i}")));
        }
        trail.drain(&keyring, &clock).expect("drain");

        let events = trail.query(&AuditQuery::default(), &keyring).expect("query");
        let actions: Vec<String> = events
            .iter()
            .filter_map(|e| match &e.kind {
                AuditKind::UserActivity { action, .. } => Some(action.clone()),
                _ => None,
            })
            .collect();
        // Newest-first means reverse logging order.
        let expected: Vec<String> = (0..10).rev().map(|i| format!("step-{i}")).collect();
        assert_eq!(actions, expected);
    }

    #[test]
    fn summarize_counts_and_mean_risk() {
        let (trail, keyring, clock, _store) = setup();
        trail.log(security_event(&clock, "login_failed", 40));
        trail.log(security_event(&clock, "login_failed", 60));
        trail.log(security_event(&clock, "integrity_failure", 90));
        trail.log(activity_event(&clock, "open"));
        trail.drain(&keyring, &clock).expect("drain");

        let summary = trail.summarize(7, &keyring, &clock).expect("summarize");
        assert_eq!(summary.total, 4);
        assert_eq!(summary.by_family.get("security"), Some(&3));
        assert_eq!(summary.by_family.get("user_activity"), Some(&1));
        assert_eq!(summary.by_severity.get("high"), Some(&3));
        assert_eq!(summary.top_event_types[0], ("login_failed".to_owned(), 2));
        assert!((summary.mean_risk_score - 190.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn summarize_window_excludes_old_events() {
        let (trail, keyring, clock, _store) = setup();
        trail.log(security_event(&clock, "old", 10));
        trail.drain(&keyring, &clock).expect("drain");

        clock.advance(10 * 24 * 60 * 60);
        trail.log(security_event(&clock, "recent", 10));
        trail.drain(&keyring, &clock).expect("drain");

        let summary = trail.summarize(7, &keyring, &clock).expect("summarize");
        assert_eq!(summary.total, 1);
        assert_eq!(summary.top_event_types[0].0, "recent");
    }

    #[test]
    fn event_json_shape_is_tagged() {
        let clock = ManualClock::new(T0);
        let event = security_event(&clock, "login_failed", 40);
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["family"], "security");
        assert_eq!(json["event_type"], "login_failed");
        assert_eq!(json["severity"], "high");
    }
}
