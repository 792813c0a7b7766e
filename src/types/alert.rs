//! Alert lifecycle types

use serde::{Deserialize, Serialize};

use super::Severity;

/// Lifecycle state of an alert.
///
/// Transitions are monotonic: ACTIVE → ACKNOWLEDGED → RESOLVED, with the
/// ACTIVE → RESOLVED shortcut allowed. RESOLVED is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertStatus::Active => write!(f, "ACTIVE"),
            AlertStatus::Acknowledged => write!(f, "ACKNOWLEDGED"),
            AlertStatus::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// Delivery channel for alert notifications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum NotificationChannel {
    InApp,
    Email,
    Sms,
    Slack,
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationChannel::InApp => write!(f, "inApp"),
            NotificationChannel::Email => write!(f, "email"),
            NotificationChannel::Sms => write!(f, "sms"),
            NotificationChannel::Slack => write!(f, "slack"),
        }
    }
}

/// Channels notified for a given alert severity.
///
/// The escalation ladder: in-app always, email from MEDIUM, sms from HIGH,
/// slack reserved for CRITICAL.
pub fn channels_for_severity(severity: Severity) -> &'static [NotificationChannel] {
    use NotificationChannel::{Email, InApp, Slack, Sms};
    match severity {
        Severity::Normal | Severity::Low => &[InApp],
        Severity::Medium => &[InApp, Email],
        Severity::High => &[InApp, Email, Sms],
        Severity::Critical => &[InApp, Email, Sms, Slack],
    }
}

/// Outcome of one delivery attempt on one channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Sent,
    Failed,
}

/// Per-channel delivery record appended to the alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub channel: NotificationChannel,
    /// Delivery completion time (ms since epoch).
    pub sent_at: u64,
    /// Channel-specific recipient ("ops@...", "+1555...", "#leak-alerts").
    pub recipient: String,
    pub status: NotificationStatus,
    /// Failure detail when status is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Operator assessment attached to an alert, latest-wins.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertFeedback {
    /// Operator confirmed a real leak.
    #[serde(default)]
    pub is_correct_positive: bool,
    /// Operator marked the alert a false positive.
    #[serde(default)]
    pub is_false_positive: bool,
    /// Free-text notes.
    #[serde(default)]
    pub notes: String,
    /// Submission time (ms since epoch), filled in by the manager.
    #[serde(default)]
    pub submitted_at: u64,
}

/// A leak alert and its full lifecycle state.
///
/// Alerts are never deleted; retention only controls whether queries return
/// them. Acknowledgment and resolution fields are non-null iff the
/// corresponding status has been reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Process-unique id: "ALERT-<monotonic counter>-<9-char token>".
    /// Ordering follows the counter, not wall clock.
    pub id: String,
    /// Creation time (ms since epoch).
    pub created_at: u64,
    pub severity: Severity,
    /// Fused leak probability at creation, [0,100].
    pub probability: f64,
    /// Network location the detection came from, if known.
    pub location: Option<String>,
    /// Id of the detection result that produced this alert.
    pub source: String,
    pub status: AlertStatus,

    // === Acknowledgment ===
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<u64>,
    pub acknowledge_note: Option<String>,

    // === Resolution ===
    pub resolved_by: Option<String>,
    pub resolved_at: Option<u64>,
    pub resolve_note: Option<String>,

    /// Latest operator feedback, if any.
    pub feedback: Option<AlertFeedback>,

    /// Per-channel delivery attempts, in completion order.
    pub notifications: Vec<NotificationRecord>,

    /// Whether an automatic valve closure was issued for this alert.
    pub valve_closure_triggered: bool,
    /// When the closure command completed (ms since epoch).
    pub valve_closure_at: Option<u64>,

    /// Operator guidance derived from severity at creation.
    pub recommended_actions: Vec<String>,
}

/// Operator guidance by severity, attached to the alert at creation.
pub fn recommended_actions(severity: Severity) -> Vec<String> {
    let actions: &[&str] = match severity {
        Severity::Critical => &[
            "Close the upstream isolation valve if automatic closure failed",
            "Dispatch a field crew to the reported location immediately",
            "Depressurize the affected segment",
            "Notify the on-call network supervisor",
        ],
        Severity::High => &[
            "Dispatch a field crew within the hour",
            "Monitor pressure on adjacent segments",
            "Prepare the isolation valve for remote closure",
        ],
        Severity::Medium => &[
            "Schedule an inspection of the reported location",
            "Review the last 24 h of pressure and flow trends",
        ],
        Severity::Low => &["Flag the location for the next routine patrol"],
        Severity::Normal => &[],
    };
    actions.iter().map(|s| (*s).to_string()).collect()
}
