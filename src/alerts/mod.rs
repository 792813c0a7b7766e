//! Alert lifecycle management.
//!
//! The manager owns the alert collection, the per-location valve record, the
//! notification fan-out, and every audit append tied to alert activity. All
//! state-changing operations take the alert lock first and the audit lock
//! second (the audit log locks internally), so the two never deadlock.
//!
//! Notification delivery runs on background tasks bounded by a semaphore and
//! a per-send timeout; a failed or timed-out channel is recorded on the alert
//! and in the audit, and never fails the lifecycle call. Valve closure is the
//! one boundary call awaited inline (under timeout): the created alert must
//! report whether containment was actually triggered.

pub mod notify;

pub use notify::{ChannelDeliveryError, DeliveryReceipt, InAppNotifier, LogNotifier, Notifier};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tracing::{info, warn};

use crate::actuator::{ActuatorError, ValveActuator};
use crate::audit::{AuditKind, AuditLog};
use crate::clock::Clock;
use crate::config::AlertConfig;
use crate::fanout::{FanoutHub, Topic};
use crate::types::{
    channels_for_severity, recommended_actions, Alert, AlertFeedback, AlertStatus,
    DetectionResult, NotificationRecord, NotificationStatus, Severity, ValvePosition,
};

/// Who last changed a valve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    System,
    Operator,
}

/// In-memory valve record per location, kept for command deduplication.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ValveEntry {
    pub position: ValvePosition,
    pub last_actor_kind: ActorKind,
    pub last_change_ms: u64,
}

/// Errors surfaced to lifecycle callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AlertError {
    #[error("Alert not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for alert {id}: {action} while {status}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: AlertStatus,
    },
}

/// Query filter for alert snapshots. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub status: Option<AlertStatus>,
    pub severity: Option<Severity>,
    pub location: Option<String>,
    /// Filter on whether the alert has ever been acknowledged.
    pub acknowledged: Option<bool>,
    /// Creation-time range (ms since epoch), inclusive.
    pub from_ms: Option<u64>,
    pub to_ms: Option<u64>,
}

impl AlertQuery {
    fn matches(&self, alert: &Alert) -> bool {
        if let Some(status) = self.status {
            if alert.status != status {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if alert.severity != severity {
                return false;
            }
        }
        if let Some(ref location) = self.location {
            if alert.location.as_deref() != Some(location.as_str()) {
                return false;
            }
        }
        if let Some(acknowledged) = self.acknowledged {
            if alert.acknowledged_at.is_some() != acknowledged {
                return false;
            }
        }
        if let Some(from) = self.from_ms {
            if alert.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to_ms {
            if alert.created_at > to {
                return false;
            }
        }
        true
    }
}

/// Counts by status within one time window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatusBreakdown {
    pub active: u64,
    pub acknowledged: u64,
    pub resolved: u64,
}

/// Alert counts within one time window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertWindowCounts {
    pub total: u64,
    pub by_status: StatusBreakdown,
    pub by_severity: BTreeMap<String, u64>,
}

/// Aggregate alert statistics.
#[derive(Debug, Clone, Serialize)]
pub struct AlertStatistics {
    pub last_hour: AlertWindowCounts,
    pub last_day: AlertWindowCounts,
    pub all_time: AlertWindowCounts,
    /// Fraction of all alerts that were ever acknowledged.
    pub acknowledge_rate: f64,
    /// Mean time from creation to acknowledgment, over acknowledged alerts.
    pub mean_ack_latency_ms: Option<f64>,
    /// Mean time from creation to resolution, over resolved alerts.
    pub mean_resolve_latency_ms: Option<f64>,
    /// Alerts whose latest feedback marks them false positives.
    pub false_positives: u64,
}

#[derive(Default)]
struct ManagerState {
    alerts: HashMap<String, Alert>,
    /// Alert ids in creation order (query ordering and purge).
    creation_order: Vec<String>,
    valves: HashMap<String, ValveEntry>,
    counter: u64,
}

/// Coordinates the alert lifecycle with audit, notifiers, and the actuator.
pub struct AlertManager {
    cfg: AlertConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    hub: Arc<FanoutHub>,
    actuator: Arc<dyn ValveActuator>,
    notifiers: Vec<Arc<dyn Notifier>>,
    state: Mutex<ManagerState>,
    /// Serializes valve-closure check-and-issue so one OPEN→CLOSED transition
    /// produces exactly one audit event.
    valve_gate: tokio::sync::Mutex<()>,
    inflight_sends: AtomicUsize,
    flush_notify: Notify,
    send_permits: Arc<Semaphore>,
}

impl AlertManager {
    pub fn new(
        cfg: AlertConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        hub: Arc<FanoutHub>,
        actuator: Arc<dyn ValveActuator>,
        notifiers: Vec<Arc<dyn Notifier>>,
    ) -> Arc<Self> {
        let permits = cfg.max_concurrent_sends.max(1);
        Arc::new(Self {
            cfg,
            clock,
            audit,
            hub,
            actuator,
            notifiers,
            state: Mutex::new(ManagerState::default()),
            valve_gate: tokio::sync::Mutex::new(()),
            inflight_sends: AtomicUsize::new(0),
            flush_notify: Notify::new(),
            send_permits: Arc::new(Semaphore::new(permits)),
        })
    }

    /// Create an alert from an accepted detection. Always succeeds.
    ///
    /// Assigns the id, audits creation, triggers valve closure for CRITICAL
    /// severity at a known location, dispatches notifications in the
    /// background, and publishes `alert.new`.
    pub async fn create(self: &Arc<Self>, detection: &DetectionResult) -> Alert {
        let now = self.clock.now_ms();
        let alert = {
            let mut state = lock_unpoisoned(&self.state);
            state.counter += 1;
            let token: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(9)
                .map(char::from)
                .collect();
            let id = format!("ALERT-{}-{}", state.counter, token);

            let alert = Alert {
                id: id.clone(),
                created_at: now,
                severity: detection.severity,
                probability: detection.probability,
                location: detection.sample.location.clone(),
                source: detection.id.clone(),
                status: AlertStatus::Active,
                acknowledged_by: None,
                acknowledged_at: None,
                acknowledge_note: None,
                resolved_by: None,
                resolved_at: None,
                resolve_note: None,
                feedback: None,
                notifications: Vec::new(),
                valve_closure_triggered: false,
                valve_closure_at: None,
                recommended_actions: recommended_actions(detection.severity),
            };
            state.alerts.insert(id.clone(), alert.clone());
            state.creation_order.push(id);

            self.audit.append(
                now,
                AuditKind::AlertCreated,
                &alert.id,
                "system",
                json!({
                    "severity": alert.severity,
                    "probability": alert.probability,
                    "location": alert.location,
                    "source": alert.source,
                }),
            );
            alert
        };

        info!(
            id = %alert.id,
            severity = %alert.severity,
            probability = alert.probability,
            location = alert.location.as_deref().unwrap_or("-"),
            "Alert created"
        );

        let alert = if alert.severity >= Severity::Critical && alert.location.is_some() {
            self.close_valve_for(&alert).await
        } else {
            alert
        };

        self.dispatch_notifications(&alert);
        self.hub.publish(Topic::AlertNew, &alert);
        alert
    }

    /// Issue the valve-closure command for a critical alert, then re-snapshot
    /// the alert with the outcome recorded.
    async fn close_valve_for(self: &Arc<Self>, alert: &Alert) -> Alert {
        let Some(location) = alert.location.clone() else {
            return alert.clone();
        };
        let _gate = self.valve_gate.lock().await;

        let already_closed = {
            let state = lock_unpoisoned(&self.state);
            state
                .valves
                .get(&location)
                .is_some_and(|entry| entry.position == ValvePosition::Closed)
        };
        if already_closed {
            self.audit.append(
                self.clock.now_ms(),
                AuditKind::ValveClosureRedundant,
                &alert.id,
                "system",
                json!({ "location": location }),
            );
            return alert.clone();
        }

        let reason = format!("leak alert {}", alert.id);
        let outcome = tokio::time::timeout(
            Duration::from_millis(self.cfg.notify_timeout_ms),
            self.actuator.close(&location, &reason),
        )
        .await;
        let outcome: Result<(), ActuatorError> = match outcome {
            Ok(result) => result,
            Err(_) => Err(ActuatorError::Timeout {
                location: location.clone(),
            }),
        };

        let now = self.clock.now_ms();
        match outcome {
            Ok(()) => {
                let snapshot = {
                    let mut state = lock_unpoisoned(&self.state);
                    state.valves.insert(
                        location.clone(),
                        ValveEntry {
                            position: ValvePosition::Closed,
                            last_actor_kind: ActorKind::System,
                            last_change_ms: now,
                        },
                    );
                    let snapshot = state.alerts.get_mut(&alert.id).map(|stored| {
                        stored.valve_closure_triggered = true;
                        stored.valve_closure_at = Some(now);
                        stored.clone()
                    });
                    self.audit.append(
                        now,
                        AuditKind::ValveClosureTriggered,
                        &alert.id,
                        "system",
                        json!({ "location": location }),
                    );
                    snapshot
                };
                self.hub.publish(
                    Topic::ValveChanged,
                    &json!({
                        "location": location,
                        "position": ValvePosition::Closed,
                        "actor": ActorKind::System,
                        "alertId": alert.id,
                    }),
                );
                info!(location = %location, alert = %alert.id, "Valve closed automatically");
                snapshot.unwrap_or_else(|| alert.clone())
            }
            Err(e) => {
                // Failed command: audit only, in-memory valve state untouched.
                warn!(location = %location, alert = %alert.id, error = %e, "Valve closure failed");
                self.audit.append(
                    now,
                    AuditKind::ValveClosureFailed,
                    &alert.id,
                    "system",
                    json!({ "location": location, "error": e.to_string() }),
                );
                alert.clone()
            }
        }
    }

    /// Acknowledge an alert.
    ///
    /// Re-acknowledging an already-acknowledged alert is idempotent: the
    /// alert is unchanged, and the repeat is still audited.
    pub fn acknowledge(
        &self,
        id: &str,
        user_id: &str,
        note: Option<&str>,
    ) -> Result<Alert, AlertError> {
        let now = self.clock.now_ms();
        let (alert, first_time) = {
            let mut state = lock_unpoisoned(&self.state);
            let alert = state
                .alerts
                .get_mut(id)
                .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
            match alert.status {
                AlertStatus::Resolved => {
                    return Err(AlertError::InvalidTransition {
                        id: id.to_string(),
                        action: "acknowledge",
                        status: AlertStatus::Resolved,
                    });
                }
                AlertStatus::Acknowledged => {
                    let snapshot = alert.clone();
                    self.audit.append(
                        now,
                        AuditKind::AlertAcknowledged,
                        id,
                        user_id,
                        json!({ "note": note, "repeat": true }),
                    );
                    (snapshot, false)
                }
                AlertStatus::Active => {
                    alert.status = AlertStatus::Acknowledged;
                    alert.acknowledged_by = Some(user_id.to_string());
                    alert.acknowledged_at = Some(now);
                    alert.acknowledge_note = note.map(str::to_string);
                    let snapshot = alert.clone();
                    self.audit.append(
                        now,
                        AuditKind::AlertAcknowledged,
                        id,
                        user_id,
                        json!({ "note": note }),
                    );
                    (snapshot, true)
                }
            }
        };
        if first_time {
            self.hub.publish(Topic::AlertAcknowledged, &alert);
            info!(id = %alert.id, user = user_id, "Alert acknowledged");
        }
        Ok(alert)
    }

    /// Resolve an alert, optionally attaching feedback. Fails once resolved.
    pub fn resolve(
        &self,
        id: &str,
        user_id: &str,
        note: Option<&str>,
        feedback: Option<AlertFeedback>,
    ) -> Result<Alert, AlertError> {
        let now = self.clock.now_ms();
        let alert = {
            let mut state = lock_unpoisoned(&self.state);
            let alert = state
                .alerts
                .get_mut(id)
                .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
            if alert.status == AlertStatus::Resolved {
                return Err(AlertError::InvalidTransition {
                    id: id.to_string(),
                    action: "resolve",
                    status: AlertStatus::Resolved,
                });
            }
            alert.status = AlertStatus::Resolved;
            alert.resolved_by = Some(user_id.to_string());
            alert.resolved_at = Some(now);
            alert.resolve_note = note.map(str::to_string);
            if let Some(mut fb) = feedback {
                fb.submitted_at = now;
                alert.feedback = Some(fb);
            }
            let snapshot = alert.clone();
            self.audit.append(
                now,
                AuditKind::AlertResolved,
                id,
                user_id,
                json!({ "note": note, "feedback": snapshot.feedback }),
            );
            snapshot
        };
        self.hub.publish(Topic::AlertResolved, &alert);
        info!(id = %alert.id, user = user_id, "Alert resolved");
        Ok(alert)
    }

    /// Attach feedback to an alert in any status; latest feedback wins.
    pub fn feedback(&self, id: &str, feedback: AlertFeedback) -> Result<AlertFeedback, AlertError> {
        let now = self.clock.now_ms();
        let mut state = lock_unpoisoned(&self.state);
        let alert = state
            .alerts
            .get_mut(id)
            .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
        let mut feedback = feedback;
        feedback.submitted_at = now;
        alert.feedback = Some(feedback.clone());
        self.audit.append(
            now,
            AuditKind::AlertFeedback,
            id,
            "operator",
            json!({
                "isCorrectPositive": feedback.is_correct_positive,
                "isFalsePositive": feedback.is_false_positive,
                "notes": feedback.notes,
            }),
        );
        Ok(feedback)
    }

    /// Snapshot of one alert.
    pub fn get(&self, id: &str) -> Option<Alert> {
        lock_unpoisoned(&self.state).alerts.get(id).cloned()
    }

    /// Filtered snapshot, newest first.
    pub fn query(&self, filter: &AlertQuery) -> Vec<Alert> {
        let state = lock_unpoisoned(&self.state);
        state
            .creation_order
            .iter()
            .rev()
            .filter_map(|id| state.alerts.get(id))
            .filter(|alert| filter.matches(alert))
            .cloned()
            .collect()
    }

    /// Aggregate statistics over the current collection.
    pub fn statistics(&self) -> AlertStatistics {
        let now = self.clock.now_ms();
        let hour_cutoff = now.saturating_sub(3_600_000);
        let day_cutoff = now.saturating_sub(86_400_000);

        let state = lock_unpoisoned(&self.state);
        let mut last_hour = AlertWindowCounts::default();
        let mut last_day = AlertWindowCounts::default();
        let mut all_time = AlertWindowCounts::default();

        let mut acked = 0_u64;
        let mut ack_latency_total = 0.0;
        let mut resolved = 0_u64;
        let mut resolve_latency_total = 0.0;
        let mut false_positives = 0_u64;

        for alert in state.alerts.values() {
            tally(&mut all_time, alert);
            if alert.created_at >= day_cutoff {
                tally(&mut last_day, alert);
            }
            if alert.created_at >= hour_cutoff {
                tally(&mut last_hour, alert);
            }
            if let Some(ack_at) = alert.acknowledged_at {
                acked += 1;
                ack_latency_total += ack_at.saturating_sub(alert.created_at) as f64;
            }
            if let Some(resolved_at) = alert.resolved_at {
                resolved += 1;
                resolve_latency_total += resolved_at.saturating_sub(alert.created_at) as f64;
            }
            if alert
                .feedback
                .as_ref()
                .is_some_and(|fb| fb.is_false_positive)
            {
                false_positives += 1;
            }
        }

        let total = all_time.total;
        AlertStatistics {
            last_hour,
            last_day,
            all_time,
            acknowledge_rate: if total > 0 {
                acked as f64 / total as f64
            } else {
                0.0
            },
            mean_ack_latency_ms: (acked > 0).then(|| ack_latency_total / acked as f64),
            mean_resolve_latency_ms: (resolved > 0)
                .then(|| resolve_latency_total / resolved as f64),
            false_positives,
        }
    }

    /// Drop alerts created before `older_than_ms` from the query index.
    /// The audit chain is never purged. Returns the number removed.
    pub fn purge(&self, older_than_ms: u64) -> usize {
        let mut state = lock_unpoisoned(&self.state);
        let before = state.alerts.len();
        state
            .alerts
            .retain(|_, alert| alert.created_at >= older_than_ms);
        let remaining: Vec<String> = state
            .creation_order
            .iter()
            .filter(|id| state.alerts.contains_key(*id))
            .cloned()
            .collect();
        state.creation_order = remaining;
        let removed = before - state.alerts.len();
        if removed > 0 {
            info!(removed, older_than_ms, "Purged aged alerts from query index");
        }
        removed
    }

    /// Current valve record for a location, if the engine has touched it.
    pub fn valve_state(&self, location: &str) -> Option<ValveEntry> {
        lock_unpoisoned(&self.state).valves.get(location).copied()
    }

    /// Explicit operator valve command, bypassing alert policy.
    pub async fn command_valve(
        self: &Arc<Self>,
        location: &str,
        position: ValvePosition,
        actor: &str,
        reason: &str,
    ) -> Result<ValveEntry, ActuatorError> {
        let _gate = self.valve_gate.lock().await;
        let command = match position {
            ValvePosition::Closed => self.actuator.close(location, reason),
            ValvePosition::Open => self.actuator.open(location, reason),
            ValvePosition::Unknown => {
                return Err(ActuatorError::CommandRejected {
                    location: location.to_string(),
                    reason: "cannot command a valve to UNKNOWN".to_string(),
                });
            }
        };
        tokio::time::timeout(Duration::from_millis(self.cfg.notify_timeout_ms), command)
            .await
            .map_err(|_| ActuatorError::Timeout {
                location: location.to_string(),
            })??;

        let now = self.clock.now_ms();
        let entry = ValveEntry {
            position,
            last_actor_kind: ActorKind::Operator,
            last_change_ms: now,
        };
        {
            let mut state = lock_unpoisoned(&self.state);
            state.valves.insert(location.to_string(), entry);
            self.audit.append(
                now,
                AuditKind::ValveCommand,
                "-",
                actor,
                json!({ "location": location, "position": position, "reason": reason }),
            );
        }
        self.hub.publish(
            Topic::ValveChanged,
            &json!({ "location": location, "position": position, "actor": ActorKind::Operator }),
        );
        Ok(entry)
    }

    /// Dispatch per-channel sends on background tasks. Never blocks the
    /// caller beyond task spawn.
    fn dispatch_notifications(self: &Arc<Self>, alert: &Alert) {
        for channel in channels_for_severity(alert.severity) {
            let notifier = self
                .notifiers
                .iter()
                .find(|n| n.channel() == *channel)
                .cloned();
            let Some(notifier) = notifier else {
                // No adaptor wired for this channel: record the miss.
                self.record_notification(
                    &alert.id,
                    NotificationRecord {
                        channel: *channel,
                        sent_at: self.clock.now_ms(),
                        recipient: String::new(),
                        status: NotificationStatus::Failed,
                        error: Some("no adaptor registered".to_string()),
                    },
                );
                continue;
            };

            let manager = Arc::clone(self);
            let alert = alert.clone();
            let channel = *channel;
            let timeout_ms = self.cfg.notify_timeout_ms;
            let permits = Arc::clone(&self.send_permits);
            self.inflight_sends.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let outcome = tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    notifier.send(&alert),
                )
                .await;
                let record = match outcome {
                    Ok(Ok(receipt)) => NotificationRecord {
                        channel,
                        sent_at: manager.clock.now_ms(),
                        recipient: receipt.recipient,
                        status: NotificationStatus::Sent,
                        error: None,
                    },
                    Ok(Err(e)) => NotificationRecord {
                        channel,
                        sent_at: manager.clock.now_ms(),
                        recipient: String::new(),
                        status: NotificationStatus::Failed,
                        error: Some(e.to_string()),
                    },
                    Err(_) => NotificationRecord {
                        channel,
                        sent_at: manager.clock.now_ms(),
                        recipient: String::new(),
                        status: NotificationStatus::Failed,
                        error: Some(format!("timed out after {timeout_ms} ms")),
                    },
                };
                manager.record_notification(&alert.id, record);
                if manager.inflight_sends.fetch_sub(1, Ordering::SeqCst) == 1 {
                    manager.flush_notify.notify_waiters();
                }
            });
        }
    }

    /// Append a delivery outcome to the alert and the audit chain.
    fn record_notification(&self, alert_id: &str, record: NotificationRecord) {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(alert) = state.alerts.get_mut(alert_id) {
            alert.notifications.push(record.clone());
        }
        let kind = match record.status {
            NotificationStatus::Sent => AuditKind::NotificationSent,
            NotificationStatus::Failed => AuditKind::NotificationFailed,
        };
        self.audit.append(
            record.sent_at,
            kind,
            alert_id,
            "system",
            json!({
                "channel": record.channel,
                "recipient": record.recipient,
                "error": record.error,
            }),
        );
    }

    /// Await quiescence of background notification sends. Used by tests and
    /// orderly shutdown; the hot path never calls this.
    pub async fn flush_notifications(&self) {
        while self.inflight_sends.load(Ordering::SeqCst) > 0 {
            let _ = tokio::time::timeout(
                Duration::from_millis(10),
                self.flush_notify.notified(),
            )
            .await;
        }
    }

    pub fn alert_count(&self) -> usize {
        lock_unpoisoned(&self.state).alerts.len()
    }
}

fn tally(window: &mut AlertWindowCounts, alert: &Alert) {
    window.total += 1;
    match alert.status {
        AlertStatus::Active => window.by_status.active += 1,
        AlertStatus::Acknowledged => window.by_status.acknowledged += 1,
        AlertStatus::Resolved => window.by_status.resolved += 1,
    }
    *window
        .by_severity
        .entry(alert.severity.to_string())
        .or_insert(0) += 1;
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::notify::test_support::{FailingNotifier, StalledNotifier};
    use super::*;
    use crate::actuator::SimulatedActuator;
    use crate::clock::ManualClock;
    use crate::types::{NotificationChannel, RawSample, RuleVerdict};

    struct Fixture {
        manager: Arc<AlertManager>,
        clock: Arc<ManualClock>,
        audit: Arc<AuditLog>,
        hub: Arc<FanoutHub>,
        actuator: Arc<SimulatedActuator>,
        in_app: Arc<InAppNotifier>,
    }

    fn fixture_with(notifiers: Vec<Arc<dyn Notifier>>) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let audit = Arc::new(AuditLog::new());
        let hub = Arc::new(FanoutHub::new(64));
        let actuator = Arc::new(SimulatedActuator::new());
        actuator.register("main", ValvePosition::Open);
        let in_app = Arc::new(InAppNotifier::new());
        let mut all: Vec<Arc<dyn Notifier>> = vec![in_app.clone()];
        all.extend(notifiers);
        let manager = AlertManager::new(
            AlertConfig {
                notify_timeout_ms: 100,
                max_concurrent_sends: 4,
            },
            clock.clone(),
            audit.clone(),
            hub.clone(),
            actuator.clone(),
            all,
        );
        Fixture {
            manager,
            clock,
            audit,
            hub,
            actuator,
            in_app,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(vec![
            Arc::new(LogNotifier::email("ops@example.com")),
            Arc::new(LogNotifier::sms("+15550100")),
            Arc::new(LogNotifier::slack("#leak-alerts")),
        ])
    }

    fn detection(severity: Severity, probability: f64, location: &str) -> DetectionResult {
        let sample = RawSample {
            timestamp: Some(999_000),
            pressure: 40.0,
            flow: 10.0,
            location: Some(location.to_string()),
            ..Default::default()
        };
        let features = crate::types::FeatureVector {
            sample: sample.clone(),
            timestamp: 999_000,
            pressure_roc: -2.0,
            flow_roc: 0.0,
            temperature_roc: 0.0,
            pressure_ma: Some(48.0),
            flow_ma: Some(10.0),
            pressure_std: Some(1.0),
            flow_std: Some(0.1),
            pf_ratio: 4.0,
            pressure_spike: false,
            flow_spike: false,
            hour_of_day: 10,
            day_of_week: 1,
            is_weekend: false,
            data_quality: 1.0,
        };
        DetectionResult {
            id: "DET-1".to_string(),
            timestamp: 999_000,
            sample,
            features,
            rule: RuleVerdict::quiet(),
            ml: None,
            probability,
            severity,
            confidence: 80.0,
            is_leak: true,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_audits() {
        let fx = fixture();
        let alert = fx.manager.create(&detection(Severity::High, 88.0, "main")).await;
        fx.manager.flush_notifications().await;

        assert!(alert.id.starts_with("ALERT-1-"));
        assert_eq!(alert.id.len(), "ALERT-1-".len() + 9);
        assert_eq!(alert.status, AlertStatus::Active);
        assert!(!alert.recommended_actions.is_empty());

        let events = fx.audit.events_for(&alert.id);
        assert_eq!(events[0].kind, AuditKind::AlertCreated);
        // HIGH → inApp + email + sms, all delivered.
        let sent = events
            .iter()
            .filter(|e| e.kind == AuditKind::NotificationSent)
            .count();
        assert_eq!(sent, 3);
        assert!(fx.audit.verify().is_ok());
    }

    #[tokio::test]
    async fn test_critical_alert_closes_valve_once() {
        let fx = fixture();
        let alert = fx.manager.create(&detection(Severity::Critical, 95.0, "main")).await;
        fx.manager.flush_notifications().await;

        assert!(alert.valve_closure_triggered);
        assert!(alert.valve_closure_at.is_some());
        assert_eq!(fx.actuator.state("main").await, ValvePosition::Closed);
        let entry = fx.manager.valve_state("main").unwrap();
        assert_eq!(entry.position, ValvePosition::Closed);
        assert_eq!(entry.last_actor_kind, ActorKind::System);

        // Second critical alert at the same location: redundant, no re-issue.
        let second = fx.manager.create(&detection(Severity::Critical, 97.0, "main")).await;
        fx.manager.flush_notifications().await;
        assert!(!second.valve_closure_triggered);

        let all = fx.audit.events();
        let closures = all
            .iter()
            .filter(|e| e.kind == AuditKind::ValveClosureTriggered)
            .count();
        let redundant = all
            .iter()
            .filter(|e| e.kind == AuditKind::ValveClosureRedundant)
            .count();
        assert_eq!(closures, 1);
        assert_eq!(redundant, 1);
    }

    #[tokio::test]
    async fn test_disabled_actuator_records_failure_without_state() {
        let fx = fixture();
        // "offline" was never registered: actuator reports unreachable.
        let alert = fx
            .manager
            .create(&detection(Severity::Critical, 95.0, "offline"))
            .await;
        fx.manager.flush_notifications().await;

        assert!(!alert.valve_closure_triggered);
        assert!(fx.manager.valve_state("offline").is_none());
        let failed = fx
            .audit
            .events_for(&alert.id)
            .iter()
            .filter(|e| e.kind == AuditKind::ValveClosureFailed)
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_lifecycle_ack_then_resolve() {
        let fx = fixture();
        let alert = fx.manager.create(&detection(Severity::Medium, 60.0, "main")).await;
        fx.manager.flush_notifications().await;
        fx.clock.advance(5_000);

        let acked = fx
            .manager
            .acknowledge(&alert.id, "u1", Some("looking"))
            .unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("u1"));
        assert_eq!(acked.acknowledged_at, Some(1_005_000));

        fx.clock.advance(5_000);
        let resolved = fx
            .manager
            .resolve(
                &alert.id,
                "u1",
                Some("fixed"),
                Some(AlertFeedback {
                    is_correct_positive: true,
                    ..Default::default()
                }),
            )
            .unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("u1"));
        assert!(resolved.feedback.unwrap().is_correct_positive);

        // Terminal: second resolve fails.
        let err = fx.manager.resolve(&alert.id, "u1", None, None).unwrap_err();
        assert!(matches!(err, AlertError::InvalidTransition { .. }));
        // And so does a late acknowledge.
        let err = fx.manager.acknowledge(&alert.id, "u2", None).unwrap_err();
        assert!(matches!(err, AlertError::InvalidTransition { .. }));

        // Audit order: created, notifications, ack, resolved.
        let kinds: Vec<AuditKind> = fx
            .audit
            .events_for(&alert.id)
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds[0], AuditKind::AlertCreated);
        let ack_pos = kinds
            .iter()
            .position(|k| *k == AuditKind::AlertAcknowledged)
            .unwrap();
        let resolve_pos = kinds
            .iter()
            .position(|k| *k == AuditKind::AlertResolved)
            .unwrap();
        assert!(ack_pos < resolve_pos);
        assert!(kinds[1..ack_pos]
            .iter()
            .all(|k| *k == AuditKind::NotificationSent));
        assert!(fx.audit.verify().is_ok());
    }

    #[tokio::test]
    async fn test_ack_is_idempotent_and_both_audited() {
        let fx = fixture();
        let alert = fx.manager.create(&detection(Severity::Low, 55.0, "main")).await;
        fx.manager.flush_notifications().await;

        let first = fx.manager.acknowledge(&alert.id, "u1", Some("on it")).unwrap();
        fx.clock.advance(60_000);
        let second = fx.manager.acknowledge(&alert.id, "u1", Some("on it")).unwrap();

        assert_eq!(first.acknowledged_at, second.acknowledged_at);
        assert_eq!(first.status, second.status);
        let acks = fx
            .audit
            .events_for(&alert.id)
            .iter()
            .filter(|e| e.kind == AuditKind::AlertAcknowledged)
            .count();
        assert_eq!(acks, 2);
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let fx = fixture();
        assert!(matches!(
            fx.manager.acknowledge("ALERT-404-xxxxxxxxx", "u1", None),
            Err(AlertError::NotFound(_))
        ));
        assert!(matches!(
            fx.manager.resolve("ALERT-404-xxxxxxxxx", "u1", None, None),
            Err(AlertError::NotFound(_))
        ));
        assert!(matches!(
            fx.manager.feedback("ALERT-404-xxxxxxxxx", AlertFeedback::default()),
            Err(AlertError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_channel_recorded_not_fatal() {
        let fx = fixture_with(vec![
            Arc::new(FailingNotifier {
                channel: NotificationChannel::Email,
                message: "smtp refused".to_string(),
            }),
            Arc::new(StalledNotifier {
                channel: NotificationChannel::Sms,
                delay: std::time::Duration::from_millis(500),
            }),
        ]);
        let alert = fx.manager.create(&detection(Severity::High, 90.0, "main")).await;
        fx.manager.flush_notifications().await;

        let stored = fx.manager.get(&alert.id).unwrap();
        assert_eq!(stored.notifications.len(), 3);
        let by_channel = |c: NotificationChannel| {
            stored
                .notifications
                .iter()
                .find(|n| n.channel == c)
                .cloned()
                .unwrap()
        };
        assert_eq!(by_channel(NotificationChannel::InApp).status, NotificationStatus::Sent);
        let email = by_channel(NotificationChannel::Email);
        assert_eq!(email.status, NotificationStatus::Failed);
        assert!(email.error.unwrap().contains("smtp refused"));
        let sms = by_channel(NotificationChannel::Sms);
        assert_eq!(sms.status, NotificationStatus::Failed);
        assert!(sms.error.unwrap().contains("timed out"));
        // The alert itself is alive and well.
        assert_eq!(stored.status, AlertStatus::Active);
    }

    #[tokio::test]
    async fn test_channels_scale_with_severity() {
        let fx = fixture();
        let low = fx.manager.create(&detection(Severity::Low, 55.0, "main")).await;
        let critical = fx
            .manager
            .create(&detection(Severity::Critical, 99.0, "main"))
            .await;
        fx.manager.flush_notifications().await;

        assert_eq!(fx.manager.get(&low.id).unwrap().notifications.len(), 1);
        assert_eq!(fx.manager.get(&critical.id).unwrap().notifications.len(), 4);
        assert_eq!(fx.in_app.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let fx = fixture();
        let a = fx.manager.create(&detection(Severity::Low, 55.0, "main")).await;
        fx.clock.advance(10_000);
        let b = fx.manager.create(&detection(Severity::High, 90.0, "east")).await;
        fx.manager.flush_notifications().await;
        fx.manager.acknowledge(&b.id, "u1", None).unwrap();

        // Newest first.
        let all = fx.manager.query(&AlertQuery::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, b.id);

        let high_only = fx.manager.query(&AlertQuery {
            severity: Some(Severity::High),
            ..Default::default()
        });
        assert_eq!(high_only.len(), 1);

        let unacked = fx.manager.query(&AlertQuery {
            acknowledged: Some(false),
            ..Default::default()
        });
        assert_eq!(unacked.len(), 1);
        assert_eq!(unacked[0].id, a.id);

        let main_recent = fx.manager.query(&AlertQuery {
            location: Some("main".to_string()),
            to_ms: Some(1_005_000),
            ..Default::default()
        });
        assert_eq!(main_recent.len(), 1);
        assert_eq!(main_recent[0].id, a.id);
    }

    #[tokio::test]
    async fn test_statistics_and_false_positive_accounting() {
        let fx = fixture();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let alert = fx.manager.create(&detection(Severity::Medium, 70.0, "main")).await;
            ids.push(alert.id);
        }
        fx.manager.flush_notifications().await;

        fx.clock.advance(2_000);
        for id in ids.iter().take(2) {
            fx.manager
                .resolve(
                    id,
                    "u1",
                    None,
                    Some(AlertFeedback {
                        is_false_positive: true,
                        ..Default::default()
                    }),
                )
                .unwrap();
        }

        let stats = fx.manager.statistics();
        assert_eq!(stats.all_time.total, 5);
        assert_eq!(stats.all_time.by_status.resolved, 2);
        assert_eq!(stats.all_time.by_status.active, 3);
        assert_eq!(stats.false_positives, 2);
        assert_eq!(stats.last_hour.total, 5);
        assert_eq!(stats.mean_resolve_latency_ms, Some(2_000.0));
        assert_eq!(stats.mean_ack_latency_ms, None);
        assert_eq!(stats.all_time.by_severity.get("MEDIUM"), Some(&5));
    }

    #[tokio::test]
    async fn test_purge_keeps_audit() {
        let fx = fixture();
        fx.manager.create(&detection(Severity::Low, 55.0, "main")).await;
        fx.clock.advance(100_000);
        let keep = fx.manager.create(&detection(Severity::Low, 55.0, "main")).await;
        fx.manager.flush_notifications().await;

        let audit_len = fx.audit.len();
        let removed = fx.manager.purge(1_050_000);
        assert_eq!(removed, 1);
        assert_eq!(fx.manager.alert_count(), 1);
        assert!(fx.manager.get(&keep.id).is_some());
        assert_eq!(fx.audit.len(), audit_len);
        assert!(fx.manager.query(&AlertQuery::default()).len() == 1);
    }

    #[tokio::test]
    async fn test_manual_valve_command() {
        let fx = fixture();
        let entry = fx
            .manager
            .command_valve("main", ValvePosition::Closed, "u9", "maintenance")
            .await
            .unwrap();
        assert_eq!(entry.position, ValvePosition::Closed);
        assert_eq!(entry.last_actor_kind, ActorKind::Operator);
        assert_eq!(fx.actuator.state("main").await, ValvePosition::Closed);
        assert!(fx
            .audit
            .events()
            .iter()
            .any(|e| e.kind == AuditKind::ValveCommand));

        let err = fx
            .manager
            .command_valve("main", ValvePosition::Unknown, "u9", "nonsense")
            .await
            .unwrap_err();
        assert!(matches!(err, ActuatorError::CommandRejected { .. }));
    }

    #[tokio::test]
    async fn test_alert_new_published_to_hub() {
        let fx = fixture();
        let sub = fx.hub.subscribe(&[Topic::AlertNew, Topic::AlertResolved]);
        let alert = fx.manager.create(&detection(Severity::Low, 55.0, "main")).await;
        fx.manager.flush_notifications().await;
        fx.manager.resolve(&alert.id, "u1", None, None).unwrap();

        let first = sub.try_recv().unwrap();
        assert_eq!(first.topic, Topic::AlertNew);
        assert_eq!(first.payload["id"], alert.id.as_str());
        let second = sub.try_recv().unwrap();
        assert_eq!(second.topic, Topic::AlertResolved);
        assert_eq!(second.payload["status"], "RESOLVED");
    }
}
