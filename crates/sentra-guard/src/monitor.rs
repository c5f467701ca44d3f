//! Security monitor: rule-driven threat detection over the audit stream.
//!
//! The monitor consumes drained audit events through [`SecurityMonitor::
//! analyze`] and maintains three pieces of state:
//!
//! - sliding failure windows per (rule, user) for threshold rules such as
//!   brute-force detection
//! - per-user behavioral baselines (login-hour distribution, known
//!   devices) for anomaly detection
//! - the threat ledger with its state machine
//!   (`active → investigating → resolved | false_positive`)
//!
//! Detection emits [`SecurityAction`]s; the suite dispatches them and
//! reports completion back. The monitor itself never touches the
//! authenticator or the store.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditKind, Severity};
use crate::clock::Clock;
use crate::error::GuardError;
use crate::ids::generate_uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Failures within the window before a brute-force threat is raised.
pub const BRUTE_FORCE_THRESHOLD: usize = 5;

/// Failure count beyond which a brute-force threat escalates to critical.
pub const BRUTE_FORCE_CRITICAL: usize = 10;

/// Brute-force sliding window: 15 minutes.
pub const BRUTE_FORCE_WINDOW_SECS: u64 = 15 * 60;

/// Baseline confidence required before anomalies are reported.
const BASELINE_MIN_CONFIDENCE: f64 = 0.7;

/// Observations at which baseline confidence saturates at 1.0.
const BASELINE_SATURATION: f64 = 30.0;

/// Deviation threshold in standard deviations.
const ANOMALY_SIGMA: f64 = 2.0;

/// Risk score stamped on anomalous-behavior threats.
const ANOMALY_RISK: u8 = 60;

/// Risk bump applied when a threshold threat escalates to critical.
const CRITICAL_RISK_BUMP: u8 = 20;

// ---------------------------------------------------------------------------
// Threats
// ---------------------------------------------------------------------------

/// Category of a detected threat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    BruteForce,
    AnomalousBehavior,
}

impl ThreatKind {
    /// Stable lowercase label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::BruteForce => "brute_force",
            Self::AnomalousBehavior => "anomalous_behavior",
        }
    }
}

/// Threat lifecycle state. `Resolved` and `FalsePositive` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatStatus {
    Active,
    Investigating,
    Resolved,
    FalsePositive,
}

impl ThreatStatus {
    /// Whether this state accepts no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::FalsePositive)
    }
}

/// Terminal outcome for [`SecurityMonitor::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreatOutcome {
    Resolved,
    FalsePositive,
}

/// A detected threat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityThreat {
    pub id: String,
    pub kind: ThreatKind,
    /// Account id when the events resolved to one, otherwise the attempted
    /// identifier (e.g. the email of a failed login).
    pub user_id: String,
    pub severity: Severity,
    /// 0–100, from the raising rule or detector.
    pub risk_score: u8,
    pub status: ThreatStatus,
    pub detected_at: u64,
    pub updated_at: u64,
    pub description: String,
    /// Evidence entries, one per contributing detection, in order.
    pub indicators: Vec<String>,
    pub details: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// What a detection wants done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    BlockUser,
    AlertAdmin,
    RequireMfa,
}

/// Action lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Completed,
    Failed,
}

/// A response action tied to a threat. Created pending; the dispatcher
/// reports the outcome via [`SecurityMonitor::complete_action`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAction {
    pub id: String,
    pub threat_id: String,
    pub user_id: String,
    pub kind: ActionKind,
    pub status: ActionStatus,
    pub created_at: u64,
    pub completed_at: Option<u64>,
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Comparison applied by a [`RuleCondition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
}

/// One field test evaluated against a Security audit event.
///
/// `field` resolves against `event_type`, `severity`, `risk_score`,
/// `user_id`, `device`, and falls back to the event's details map.
/// Numeric operators parse both sides as integers and fail the condition
/// when either side does not parse.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: String,
}

impl RuleCondition {
    fn holds(&self, event: &AuditEvent) -> bool {
        let Some(actual) = resolve_field(event, &self.field) else {
            return false;
        };
        match self.operator {
            ConditionOperator::Equals => actual == self.value,
            ConditionOperator::NotEquals => actual != self.value,
            ConditionOperator::Contains => actual.contains(&self.value),
            ConditionOperator::GreaterThan => {
                compare_numeric(&actual, &self.value) == Some(std::cmp::Ordering::Greater)
            }
            ConditionOperator::LessThan => {
                compare_numeric(&actual, &self.value) == Some(std::cmp::Ordering::Less)
            }
        }
    }
}

fn resolve_field(event: &AuditEvent, field: &str) -> Option<String> {
    let AuditKind::Security {
        event_type,
        severity,
        risk_score,
        details,
    } = &event.kind
    else {
        return None;
    };
    match field {
        "event_type" => Some(event_type.clone()),
        "severity" => Some(severity.label().to_owned()),
        "risk_score" => Some(risk_score.to_string()),
        "user_id" => event.user_id.clone(),
        "device" => event.device.clone(),
        other => details.get(other).cloned(),
    }
}

fn compare_numeric(actual: &str, value: &str) -> Option<std::cmp::Ordering> {
    let a: i64 = actual.parse().ok()?;
    let b: i64 = value.parse().ok()?;
    Some(a.cmp(&b))
}

/// A declarative threshold rule over Security audit events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    /// All conditions must hold for an event to count toward the window.
    pub conditions: Vec<RuleCondition>,
    /// Matches within the window before a threat is raised.
    pub threshold: usize,
    /// Count beyond which severity escalates to critical.
    pub critical_above: usize,
    pub window_secs: u64,
    pub threat_kind: ThreatKind,
    pub base_severity: Severity,
    /// Risk score stamped on threats this rule raises.
    pub risk_score: u8,
    pub actions: Vec<ActionKind>,
}

impl MonitoringRule {
    /// Whether a Security event counts toward this rule's window.
    #[must_use]
    pub fn matches(&self, event: &AuditEvent) -> bool {
        matches!(event.kind, AuditKind::Security { .. })
            && self.conditions.iter().all(|c| c.holds(event))
    }

    /// The built-in brute-force rule: 5 failures in 15 minutes raises a
    /// high-severity threat, more than 10 escalates to critical, response
    /// is block + admin alert.
    #[must_use]
    pub fn brute_force() -> Self {
        Self {
            id: "rule-brute-force".to_owned(),
            name: "Repeated login failures".to_owned(),
            enabled: true,
            conditions: vec![RuleCondition {
                field: "event_type".to_owned(),
                operator: ConditionOperator::Equals,
                value: "login_failed".to_owned(),
            }],
            threshold: BRUTE_FORCE_THRESHOLD,
            critical_above: BRUTE_FORCE_CRITICAL,
            window_secs: BRUTE_FORCE_WINDOW_SECS,
            threat_kind: ThreatKind::BruteForce,
            base_severity: Severity::High,
            risk_score: 70,
            actions: vec![ActionKind::BlockUser, ActionKind::AlertAdmin],
        }
    }
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Per-user behavioral baseline learned from successful logins.
#[derive(Clone, Debug, Default)]
struct UserBaseline {
    login_hours: Vec<u8>,
    devices: BTreeSet<String>,
}

impl UserBaseline {
    /// 0.0 with no history, saturating at 1.0.
    fn confidence(&self) -> f64 {
        baseline_confidence(self.login_hours.len())
    }

    /// Deviation of `hour` from the historical mean, in standard
    /// deviations. `None` when the history has no spread.
    fn hour_deviation(&self, hour: u8) -> Option<f64> {
        hour_deviation(&self.login_hours, hour)
    }

    fn observe(&mut self, hour: u8, device: Option<&str>) {
        self.login_hours.push(hour);
        if let Some(device) = device {
            self.devices.insert(device.to_owned());
        }
    }
}

// f64 statistics over small sample vectors.
#[allow(clippy::arithmetic_side_effects, clippy::cast_precision_loss)]
fn baseline_confidence(samples: usize) -> f64 {
    (samples as f64 / BASELINE_SATURATION).min(1.0)
}

#[allow(clippy::arithmetic_side_effects, clippy::cast_precision_loss)]
fn hour_deviation(history: &[u8], hour: u8) -> Option<f64> {
    if history.is_empty() {
        return None;
    }
    let n = history.len() as f64;
    let mean = history.iter().map(|h| f64::from(*h)).sum::<f64>() / n;
    let variance = history
        .iter()
        .map(|h| {
            let d = f64::from(*h) - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let std = variance.sqrt();
    if std < f64::EPSILON {
        // Degenerate history (every login at the same hour): any other
        // hour is maximally deviant.
        if (f64::from(hour) - mean).abs() < f64::EPSILON {
            return Some(0.0);
        }
        return Some(f64::INFINITY);
    }
    Some((f64::from(hour) - mean).abs() / std)
}

/// Who a Security event counts against: the resolved account, or the
/// attempted email when no account matched.
fn threat_subject(event: &AuditEvent) -> Option<String> {
    if let Some(user_id) = &event.user_id {
        return Some(user_id.clone());
    }
    match &event.kind {
        AuditKind::Security { details, .. } => details.get("email").cloned(),
        AuditKind::UserActivity { .. } | AuditKind::System { .. } => None,
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Aggregate counters for [`SecurityMonitor::metrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SecurityMetrics {
    pub threats_detected: usize,
    pub threats_active: usize,
    pub threats_resolved: usize,
    pub false_positives: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub actions_pending: usize,
    pub actions_completed: usize,
    pub actions_failed: usize,
}

/// The security monitor.
pub struct SecurityMonitor {
    rules: Vec<MonitoringRule>,
    threats: HashMap<String, SecurityThreat>,
    actions: HashMap<String, SecurityAction>,
    /// (rule id, user id) → timestamps of matching events.
    occurrences: HashMap<(String, String), VecDeque<u64>>,
    baselines: HashMap<String, UserBaseline>,
}

impl SecurityMonitor {
    /// Monitor with the built-in rule set.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rules(vec![MonitoringRule::brute_force()])
    }

    /// Monitor with a custom rule set.
    #[must_use]
    pub fn with_rules(rules: Vec<MonitoringRule>) -> Self {
        Self {
            rules,
            threats: HashMap::new(),
            actions: HashMap::new(),
            occurrences: HashMap::new(),
            baselines: HashMap::new(),
        }
    }

    /// The configured rules.
    #[must_use]
    pub fn rules(&self) -> &[MonitoringRule] {
        &self.rules
    }

    /// Add a rule at runtime.
    pub fn add_rule(&mut self, rule: MonitoringRule) {
        self.rules.push(rule);
    }

    // -----------------------------------------------------------------------
    // Analysis
    // -----------------------------------------------------------------------

    /// Feed one audit event through every detector. Returns freshly
    /// created pending actions for the caller to dispatch.
    pub fn analyze(&mut self, event: &AuditEvent, clock: &dyn Clock) -> Vec<SecurityAction> {
        match &event.kind {
            AuditKind::Security { .. } => self.apply_threshold_rules(event, clock),
            AuditKind::UserActivity {
                action, success, ..
            } if action == "login" && *success => self.apply_baseline(event, clock),
            AuditKind::UserActivity { .. } | AuditKind::System { .. } => Vec::new(),
        }
    }

    fn apply_threshold_rules(&mut self, event: &AuditEvent, clock: &dyn Clock) -> Vec<SecurityAction> {
        let AuditKind::Security { event_type, .. } = &event.kind else {
            return Vec::new();
        };
        // Events that never resolved to an account still accumulate,
        // keyed on the attempted identifier.
        let Some(subject) = threat_subject(event) else {
            return Vec::new();
        };
        let now = clock.now_unix();
        let mut created = Vec::new();

        let matching: Vec<MonitoringRule> = self
            .rules
            .iter()
            .filter(|r| r.enabled && r.matches(event))
            .cloned()
            .collect();

        for rule in matching {
            let window = self
                .occurrences
                .entry((rule.id.clone(), subject.clone()))
                .or_default();
            window.push_back(event.timestamp);
            let cutoff = now.saturating_sub(rule.window_secs);
            while window.front().is_some_and(|t| *t < cutoff) {
                window.pop_front();
            }
            let count = window.len();
            if count < rule.threshold {
                continue;
            }

            let severity = if count > rule.critical_above {
                Severity::Critical
            } else {
                rule.base_severity
            };
            let risk_score = if severity == Severity::Critical {
                rule.risk_score.saturating_add(CRITICAL_RISK_BUMP).min(100)
            } else {
                rule.risk_score
            };
            let indicator = format!(
                "'{event_type}' at {}: {count} within {}s",
                event.timestamp, rule.window_secs
            );

            // One live threat per (kind, subject): further matches update
            // it in place rather than duplicating.
            let existing = self
                .threats
                .values_mut()
                .find(|t| t.user_id == subject && t.kind == rule.threat_kind && !t.status.is_terminal());
            if let Some(threat) = existing {
                threat.severity = severity;
                threat.risk_score = risk_score;
                threat.updated_at = now;
                threat.indicators.push(indicator);
                threat
                    .details
                    .insert("event_count".to_owned(), count.to_string());
                continue;
            }

            let threat_id = generate_uuid();
            let mut details = BTreeMap::new();
            details.insert("event_count".to_owned(), count.to_string());
            details.insert("rule_id".to_owned(), rule.id.clone());
            let threat = SecurityThreat {
                id: threat_id.clone(),
                kind: rule.threat_kind,
                user_id: subject.clone(),
                severity,
                risk_score,
                status: ThreatStatus::Active,
                detected_at: now,
                updated_at: now,
                description: format!(
                    "{count} '{event_type}' events within {}s",
                    rule.window_secs
                ),
                indicators: vec![indicator],
                details,
            };
            warn!(threat_id = %threat.id, subject = %subject, kind = threat.kind.label(), "threat detected");
            self.threats.insert(threat_id.clone(), threat);

            for kind in &rule.actions {
                created.push(self.create_action(&threat_id, &subject, *kind, now));
            }
        }
        created
    }

    fn apply_baseline(&mut self, event: &AuditEvent, clock: &dyn Clock) -> Vec<SecurityAction> {
        let Some(user_id) = event.user_id.clone() else {
            return Vec::new();
        };
        let now = clock.now_unix();
        // Hour-of-day of the event.
        #[allow(clippy::arithmetic_side_effects)]
        let hour = u8::try_from((event.timestamp / 3600) % 24).unwrap_or(0);

        let baseline = self.baselines.entry(user_id.clone()).or_default();
        let confidence = baseline.confidence();
        let deviation = baseline.hour_deviation(hour);
        let known_device = event
            .device
            .as_deref()
            .map_or(true, |d| baseline.devices.contains(d));

        // The check runs against the baseline as it was before this login,
        // then the login joins the history.
        baseline.observe(hour, event.device.as_deref());

        let anomalous_hour = deviation.is_some_and(|d| d > ANOMALY_SIGMA);
        if confidence <= BASELINE_MIN_CONFIDENCE || !anomalous_hour {
            return Vec::new();
        }

        let mut indicators = Vec::new();
        if let Some(d) = deviation {
            indicators.push(format!(
                "login hour {hour:02} deviates {d:.2} sigma from baseline"
            ));
        }
        if !known_device {
            if let Some(device) = &event.device {
                indicators.push(format!("unrecognized device '{device}'"));
            }
        }

        let existing = self
            .threats
            .values_mut()
            .find(|t| t.user_id == user_id && t.kind == ThreatKind::AnomalousBehavior && !t.status.is_terminal());
        if let Some(threat) = existing {
            threat.updated_at = now;
            threat.indicators.extend(indicators);
            return Vec::new();
        }

        let threat_id = generate_uuid();
        let mut details = BTreeMap::new();
        details.insert("login_hour".to_owned(), hour.to_string());
        if let Some(d) = deviation {
            details.insert("hour_deviation_sigma".to_owned(), format!("{d:.2}"));
        }
        details.insert("known_device".to_owned(), known_device.to_string());
        if let Some(device) = &event.device {
            details.insert("device".to_owned(), device.clone());
        }
        let threat = SecurityThreat {
            id: threat_id.clone(),
            kind: ThreatKind::AnomalousBehavior,
            user_id: user_id.clone(),
            severity: Severity::Medium,
            risk_score: ANOMALY_RISK,
            status: ThreatStatus::Active,
            detected_at: now,
            updated_at: now,
            description: format!("login at unusual hour {hour:02}:00"),
            indicators,
            details,
        };
        info!(threat_id = %threat.id, user_id = %user_id, "anomalous login detected");
        self.threats.insert(threat_id.clone(), threat);

        vec![self.create_action(&threat_id, &user_id, ActionKind::RequireMfa, now)]
    }

    fn create_action(
        &mut self,
        threat_id: &str,
        user_id: &str,
        kind: ActionKind,
        now: u64,
    ) -> SecurityAction {
        let action = SecurityAction {
            id: generate_uuid(),
            threat_id: threat_id.to_owned(),
            user_id: user_id.to_owned(),
            kind,
            status: ActionStatus::Pending,
            created_at: now,
            completed_at: None,
        };
        self.actions.insert(action.id.clone(), action.clone());
        action
    }

    // -----------------------------------------------------------------------
    // Threat lifecycle
    // -----------------------------------------------------------------------

    /// Move an active threat into investigation.
    ///
    /// # Errors
    ///
    /// - [`GuardError::ThreatNotFound`]
    /// - [`GuardError::Validation`] — not in `Active`
    pub fn start_investigation(&mut self, threat_id: &str) -> Result<(), GuardError> {
        let threat = self
            .threats
            .get_mut(threat_id)
            .ok_or_else(|| GuardError::ThreatNotFound(threat_id.to_owned()))?;
        if threat.status != ThreatStatus::Active {
            return Err(GuardError::Validation(format!(
                "cannot investigate a threat in state {:?}",
                threat.status
            )));
        }
        threat.status = ThreatStatus::Investigating;
        Ok(())
    }

    /// Close a threat. Valid from `Active` or `Investigating`; terminal
    /// states reject further transitions.
    ///
    /// # Errors
    ///
    /// - [`GuardError::ThreatNotFound`]
    /// - [`GuardError::Validation`] — already terminal
    pub fn resolve(
        &mut self,
        threat_id: &str,
        outcome: ThreatOutcome,
        clock: &dyn Clock,
    ) -> Result<(), GuardError> {
        let threat = self
            .threats
            .get_mut(threat_id)
            .ok_or_else(|| GuardError::ThreatNotFound(threat_id.to_owned()))?;
        if threat.status.is_terminal() {
            return Err(GuardError::Validation(
                "threat is already closed".to_owned(),
            ));
        }
        threat.status = match outcome {
            ThreatOutcome::Resolved => ThreatStatus::Resolved,
            ThreatOutcome::FalsePositive => ThreatStatus::FalsePositive,
        };
        threat.updated_at = clock.now_unix();
        info!(threat_id, status = ?threat.status, "threat closed");
        Ok(())
    }

    /// Report the outcome of a dispatched action.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Validation`] for an unknown action id.
    pub fn complete_action(
        &mut self,
        action_id: &str,
        success: bool,
        clock: &dyn Clock,
    ) -> Result<(), GuardError> {
        let action = self
            .actions
            .get_mut(action_id)
            .ok_or_else(|| GuardError::Validation(format!("unknown action: {action_id}")))?;
        action.status = if success {
            ActionStatus::Completed
        } else {
            ActionStatus::Failed
        };
        action.completed_at = Some(clock.now_unix());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// All non-terminal threats, newest detection first.
    #[must_use]
    pub fn active_threats(&self) -> Vec<SecurityThreat> {
        let mut threats: Vec<SecurityThreat> = self
            .threats
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();
        threats.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then(a.id.cmp(&b.id)));
        threats
    }

    /// Look up a threat by id.
    #[must_use]
    pub fn threat(&self, threat_id: &str) -> Option<&SecurityThreat> {
        self.threats.get(threat_id)
    }

    /// Actions for a threat, oldest first.
    #[must_use]
    pub fn actions_for_threat(&self, threat_id: &str) -> Vec<SecurityAction> {
        let mut actions: Vec<SecurityAction> = self
            .actions
            .values()
            .filter(|a| a.threat_id == threat_id)
            .cloned()
            .collect();
        actions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        actions
    }

    /// Counters over the trailing `window_days`.
    #[must_use]
    pub fn metrics(&self, window_days: u64, clock: &dyn Clock) -> SecurityMetrics {
        let since = clock
            .now_unix()
            .saturating_sub(window_days.saturating_mul(86_400));
        let mut metrics = SecurityMetrics::default();

        for threat in self.threats.values() {
            if threat.detected_at < since {
                continue;
            }
            metrics.threats_detected = metrics.threats_detected.saturating_add(1);
            let counter = metrics
                .by_kind
                .entry(threat.kind.label().to_owned())
                .or_insert(0);
            *counter = counter.saturating_add(1);
            match threat.status {
                ThreatStatus::Active | ThreatStatus::Investigating => {
                    metrics.threats_active = metrics.threats_active.saturating_add(1);
                }
                ThreatStatus::Resolved => {
                    metrics.threats_resolved = metrics.threats_resolved.saturating_add(1);
                }
                ThreatStatus::FalsePositive => {
                    metrics.false_positives = metrics.false_positives.saturating_add(1);
                }
            }
        }
        for action in self.actions.values() {
            if action.created_at < since {
                continue;
            }
            match action.status {
                ActionStatus::Pending => {
                    metrics.actions_pending = metrics.actions_pending.saturating_add(1);
                }
                ActionStatus::Completed => {
                    metrics.actions_completed = metrics.actions_completed.saturating_add(1);
                }
                ActionStatus::Failed => {
                    metrics.actions_failed = metrics.actions_failed.saturating_add(1);
                }
            }
        }
        metrics
    }
}

impl Default for SecurityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const T0: u64 = 1_700_000_000;

    fn failure(clock: &dyn Clock, user: &str) -> AuditEvent {
        AuditEvent::new(
            AuditKind::Security {
                event_type: "login_failed".to_owned(),
                severity: Severity::Medium,
                risk_score: 40,
                details: BTreeMap::new(),
            },
            clock,
        )
        .with_user(user)
    }

    fn login(clock: &dyn Clock, user: &str, device: &str) -> AuditEvent {
        AuditEvent::new(
            AuditKind::UserActivity {
                action: "login".to_owned(),
                success: true,
                duration_ms: 10,
            },
            clock,
        )
        .with_user(user)
        .with_device(device)
    }

    /// Unix timestamp at `hour:00` of some fixed day.
    const fn at_hour(hour: u64) -> u64 {
        // T0 rounded down to midnight, plus the hour.
        (T0 / 86_400) * 86_400 + hour * 3_600
    }

    #[test]
    fn four_failures_do_not_raise_a_threat() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for _ in 0..4 {
            assert!(monitor.analyze(&failure(&clock, "u1"), &clock).is_empty());
        }
        assert!(monitor.active_threats().is_empty());
    }

    #[test]
    fn fifth_failure_raises_high_threat_with_actions() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        let mut actions = Vec::new();
        for _ in 0..5 {
            actions = monitor.analyze(&failure(&clock, "u1"), &clock);
        }

        let threats = monitor.active_threats();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].kind, ThreatKind::BruteForce);
        assert_eq!(threats[0].severity, Severity::High);
        assert_eq!(threats[0].status, ThreatStatus::Active);

        let kinds: Vec<ActionKind> = actions.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionKind::BlockUser, ActionKind::AlertAdmin]);
    }

    #[test]
    fn sixth_failure_updates_not_duplicates() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for _ in 0..6 {
            monitor.analyze(&failure(&clock, "u1"), &clock);
        }
        let threats = monitor.active_threats();
        assert_eq!(threats.len(), 1, "exactly one live threat per user");
        assert_eq!(threats[0].details.get("event_count"), Some(&"6".to_owned()));
    }

    #[test]
    fn eleventh_failure_escalates_to_critical() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for _ in 0..10 {
            monitor.analyze(&failure(&clock, "u1"), &clock);
        }
        assert_eq!(monitor.active_threats()[0].severity, Severity::High);

        monitor.analyze(&failure(&clock, "u1"), &clock);
        assert_eq!(monitor.active_threats()[0].severity, Severity::Critical);
        assert_eq!(monitor.active_threats()[0].risk_score, 90);
    }

    #[test]
    fn threat_carries_risk_score_and_ordered_indicators() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for _ in 0..5 {
            monitor.analyze(&failure(&clock, "u1"), &clock);
        }
        let threat = &monitor.active_threats()[0];
        assert_eq!(threat.risk_score, 70);
        assert_eq!(threat.indicators.len(), 1);
        assert!(threat.indicators[0].contains("login_failed"));

        monitor.analyze(&failure(&clock, "u1"), &clock);
        let threat = &monitor.active_threats()[0];
        assert_eq!(threat.indicators.len(), 2, "each match adds evidence");
    }

    #[test]
    fn failures_without_account_key_on_email() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        let mut details = BTreeMap::new();
        details.insert("email".to_owned(), "ghost@example.com".to_owned());
        let event = AuditEvent::new(
            AuditKind::Security {
                event_type: "login_failed".to_owned(),
                severity: Severity::Medium,
                risk_score: 40,
                details,
            },
            &clock,
        );
        for _ in 0..5 {
            monitor.analyze(&event, &clock);
        }
        let threats = monitor.active_threats();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].user_id, "ghost@example.com");
    }

    #[test]
    fn rule_conditions_compare_header_fields() {
        let rule = MonitoringRule {
            id: "rule-high-risk".to_owned(),
            name: "High-risk events".to_owned(),
            enabled: true,
            conditions: vec![RuleCondition {
                field: "risk_score".to_owned(),
                operator: ConditionOperator::GreaterThan,
                value: "80".to_owned(),
            }],
            threshold: 1,
            critical_above: usize::MAX,
            window_secs: 600,
            threat_kind: ThreatKind::AnomalousBehavior,
            base_severity: Severity::High,
            risk_score: 85,
            actions: vec![ActionKind::AlertAdmin],
        };
        let mut monitor = SecurityMonitor::with_rules(vec![rule]);
        let clock = ManualClock::new(T0);

        monitor.analyze(&failure(&clock, "u1"), &clock);
        assert!(monitor.active_threats().is_empty(), "risk 40 is below 80");

        let hot = AuditEvent::new(
            AuditKind::Security {
                event_type: "integrity_failure".to_owned(),
                severity: Severity::Critical,
                risk_score: 95,
                details: BTreeMap::new(),
            },
            &clock,
        )
        .with_user("u1");
        let actions = monitor.analyze(&hot, &clock);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::AlertAdmin);
        assert_eq!(monitor.active_threats()[0].risk_score, 85);
    }

    #[test]
    fn condition_operators_match_details_and_substrings() {
        let clock = ManualClock::new(T0);
        let mut details = BTreeMap::new();
        details.insert("email".to_owned(), "ghost@example.com".to_owned());
        let event = AuditEvent::new(
            AuditKind::Security {
                event_type: "login_failed".to_owned(),
                severity: Severity::Medium,
                risk_score: 40,
                details,
            },
            &clock,
        );

        let contains = RuleCondition {
            field: "email".to_owned(),
            operator: ConditionOperator::Contains,
            value: "@example.com".to_owned(),
        };
        assert!(contains.holds(&event));

        let not_equals = RuleCondition {
            field: "severity".to_owned(),
            operator: ConditionOperator::NotEquals,
            value: "critical".to_owned(),
        };
        assert!(not_equals.holds(&event));

        let missing = RuleCondition {
            field: "ip".to_owned(),
            operator: ConditionOperator::Equals,
            value: "10.0.0.1".to_owned(),
        };
        assert!(!missing.holds(&event), "absent field never matches");
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for _ in 0..4 {
            monitor.analyze(&failure(&clock, "u1"), &clock);
        }
        clock.advance(BRUTE_FORCE_WINDOW_SECS + 1);
        monitor.analyze(&failure(&clock, "u1"), &clock);
        assert!(
            monitor.active_threats().is_empty(),
            "stale failures must age out of the window"
        );
    }

    #[test]
    fn failures_are_tracked_per_user() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for _ in 0..3 {
            monitor.analyze(&failure(&clock, "u1"), &clock);
            monitor.analyze(&failure(&clock, "u2"), &clock);
        }
        assert!(monitor.active_threats().is_empty());
        monitor.analyze(&failure(&clock, "u1"), &clock);
        monitor.analyze(&failure(&clock, "u1"), &clock);
        let threats = monitor.active_threats();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].user_id, "u1");
    }

    #[test]
    fn threat_state_machine() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for _ in 0..5 {
            monitor.analyze(&failure(&clock, "u1"), &clock);
        }
        let id = monitor.active_threats()[0].id.clone();

        monitor.start_investigation(&id).expect("investigate");
        assert_eq!(
            monitor.threat(&id).expect("threat").status,
            ThreatStatus::Investigating
        );

        // Investigating cannot be investigated again.
        assert!(monitor.start_investigation(&id).is_err());

        monitor
            .resolve(&id, ThreatOutcome::Resolved, &clock)
            .expect("resolve");
        assert_eq!(
            monitor.threat(&id).expect("threat").status,
            ThreatStatus::Resolved
        );

        // Terminal is terminal.
        assert!(monitor
            .resolve(&id, ThreatOutcome::FalsePositive, &clock)
            .is_err());
    }

    #[test]
    fn direct_active_to_terminal_is_allowed() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for _ in 0..5 {
            monitor.analyze(&failure(&clock, "u1"), &clock);
        }
        let id = monitor.active_threats()[0].id.clone();
        monitor
            .resolve(&id, ThreatOutcome::FalsePositive, &clock)
            .expect("resolve");
        assert_eq!(
            monitor.threat(&id).expect("threat").status,
            ThreatStatus::FalsePositive
        );
    }

    #[test]
    fn resolving_unknown_threat_fails() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        assert!(matches!(
            monitor.resolve("nope", ThreatOutcome::Resolved, &clock),
            Err(GuardError::ThreatNotFound(_))
        ));
    }

    #[test]
    fn new_threat_after_resolution() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for _ in 0..5 {
            monitor.analyze(&failure(&clock, "u1"), &clock);
        }
        let first = monitor.active_threats()[0].id.clone();
        monitor
            .resolve(&first, ThreatOutcome::Resolved, &clock)
            .expect("resolve");

        // The window still holds the old failures, so one more re-triggers
        // as a fresh threat.
        monitor.analyze(&failure(&clock, "u1"), &clock);
        let threats = monitor.active_threats();
        assert_eq!(threats.len(), 1);
        assert_ne!(threats[0].id, first);
    }

    #[test]
    fn anomaly_requires_confident_baseline() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(at_hour(10));
        // Only 5 observations: confidence too low to judge.
        for _ in 0..5 {
            monitor.analyze(&login(&clock, "u1", "laptop"), &clock);
        }
        clock.set(at_hour(3));
        let actions = monitor.analyze(&login(&clock, "u1", "laptop"), &clock);
        assert!(actions.is_empty());
        assert!(monitor.active_threats().is_empty());
    }

    #[test]
    fn off_hours_login_with_confident_baseline_requires_mfa() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        // 30 logins spread over working hours.
        for i in 0..30u64 {
            clock.set(at_hour(9 + (i % 8)));
            monitor.analyze(&login(&clock, "u1", "laptop"), &clock);
        }

        clock.set(at_hour(3));
        let actions = monitor.analyze(&login(&clock, "u1", "laptop"), &clock);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::RequireMfa);

        let threats = monitor.active_threats();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].kind, ThreatKind::AnomalousBehavior);
        assert_eq!(threats[0].risk_score, ANOMALY_RISK);
        assert!(threats[0].indicators[0].contains("sigma"));
    }

    #[test]
    fn repeated_anomaly_updates_existing_threat() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for i in 0..30u64 {
            clock.set(at_hour(9 + (i % 8)));
            monitor.analyze(&login(&clock, "u1", "laptop"), &clock);
        }
        clock.set(at_hour(3));
        monitor.analyze(&login(&clock, "u1", "laptop"), &clock);
        let actions = monitor.analyze(&login(&clock, "u1", "laptop"), &clock);
        assert!(actions.is_empty(), "no duplicate threat or actions");
        assert_eq!(monitor.active_threats().len(), 1);
    }

    #[test]
    fn usual_hours_login_is_clean() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for i in 0..30u64 {
            clock.set(at_hour(9 + (i % 8)));
            monitor.analyze(&login(&clock, "u1", "laptop"), &clock);
        }
        clock.set(at_hour(12));
        let actions = monitor.analyze(&login(&clock, "u1", "laptop"), &clock);
        assert!(actions.is_empty());
        assert!(monitor.active_threats().is_empty());
    }

    #[test]
    fn action_lifecycle() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        let mut actions = Vec::new();
        for _ in 0..5 {
            actions = monitor.analyze(&failure(&clock, "u1"), &clock);
        }
        let threat_id = actions[0].threat_id.clone();

        monitor
            .complete_action(&actions[0].id, true, &clock)
            .expect("complete");
        monitor
            .complete_action(&actions[1].id, false, &clock)
            .expect("complete");

        let stored = monitor.actions_for_threat(&threat_id);
        assert_eq!(stored[0].status, ActionStatus::Completed);
        assert_eq!(stored[0].completed_at, Some(T0));
        assert_eq!(stored[1].status, ActionStatus::Failed);
    }

    #[test]
    fn metrics_roll_up() {
        let mut monitor = SecurityMonitor::new();
        let clock = ManualClock::new(T0);
        for _ in 0..5 {
            monitor.analyze(&failure(&clock, "u1"), &clock);
        }
        for _ in 0..5 {
            monitor.analyze(&failure(&clock, "u2"), &clock);
        }
        let id = monitor
            .active_threats()
            .iter()
            .find(|t| t.user_id == "u2")
            .expect("threat")
            .id
            .clone();
        monitor
            .resolve(&id, ThreatOutcome::FalsePositive, &clock)
            .expect("resolve");

        let metrics = monitor.metrics(7, &clock);
        assert_eq!(metrics.threats_detected, 2);
        assert_eq!(metrics.threats_active, 1);
        assert_eq!(metrics.false_positives, 1);
        assert_eq!(metrics.by_kind.get("brute_force"), Some(&2));
        assert_eq!(metrics.actions_pending, 4);
    }

    #[test]
    fn disabled_rule_is_inert() {
        let mut rule = MonitoringRule::brute_force();
        rule.enabled = false;
        let mut monitor = SecurityMonitor::with_rules(vec![rule]);
        let clock = ManualClock::new(T0);
        for _ in 0..10 {
            monitor.analyze(&failure(&clock, "u1"), &clock);
        }
        assert!(monitor.active_threats().is_empty());
    }
}
