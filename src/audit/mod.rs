//! Append-only hash-chained audit log.
//!
//! Every lifecycle-relevant action appends an event whose hash covers the
//! event fields plus the previous event's hash, so any in-place edit breaks
//! the chain. The hash is md5 over a canonical rendering (sorted keys, no
//! whitespace) — tamper evidence, not cryptographic identity, which the
//! system explicitly does not promise.
//!
//! The log is an in-memory primary guarded by one mutex. `verify()` walks
//! the chain and reports the first inconsistency; exports emit the full
//! chain in order.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Hash of "nothing": the `prev_hash` of the first event in a chain.
pub const ZERO_HASH: &str = "00000000000000000000000000000000";

/// What happened, in audit vocabulary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    AlertCreated,
    AlertAcknowledged,
    AlertResolved,
    AlertFeedback,
    NotificationSent,
    NotificationFailed,
    ValveClosureTriggered,
    ValveClosureFailed,
    ValveClosureRedundant,
    ValveCommand,
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditKind::AlertCreated => "ALERT_CREATED",
            AuditKind::AlertAcknowledged => "ALERT_ACKNOWLEDGED",
            AuditKind::AlertResolved => "ALERT_RESOLVED",
            AuditKind::AlertFeedback => "ALERT_FEEDBACK",
            AuditKind::NotificationSent => "NOTIFICATION_SENT",
            AuditKind::NotificationFailed => "NOTIFICATION_FAILED",
            AuditKind::ValveClosureTriggered => "VALVE_CLOSURE_TRIGGERED",
            AuditKind::ValveClosureFailed => "VALVE_CLOSURE_FAILED",
            AuditKind::ValveClosureRedundant => "VALVE_CLOSURE_REDUNDANT",
            AuditKind::ValveCommand => "VALVE_COMMAND",
        };
        write!(f, "{s}")
    }
}

/// One chained audit event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    /// Contiguous from 1 within a chain.
    pub seq: u64,
    /// Event time (ms since epoch), supplied by the caller's clock.
    pub timestamp: u64,
    pub kind: AuditKind,
    /// Alert id, or "-" for events without a subject.
    pub subject_id: String,
    /// User id, or "system".
    pub actor: String,
    pub payload: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

/// First inconsistency found while verifying a chain.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IntegrityError {
    #[error("Sequence gap at position {position}: found seq {found}, expected {expected}")]
    SequenceGap {
        position: usize,
        found: u64,
        expected: u64,
    },

    #[error("Broken link at seq {seq}: prev_hash {found} != prior hash {expected}")]
    BrokenLink {
        seq: u64,
        found: String,
        expected: String,
    },

    #[error("Hash mismatch at seq {seq}: stored {stored}, computed {computed}")]
    HashMismatch {
        seq: u64,
        stored: String,
        computed: String,
    },
}

/// Append-only hash-chained event store.
pub struct AuditLog {
    inner: Mutex<Chain>,
}

#[derive(Debug, Default)]
struct Chain {
    events: Vec<AuditEvent>,
    last_hash: String,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Chain {
                events: Vec::new(),
                last_hash: ZERO_HASH.to_string(),
            }),
        }
    }

    /// Append an event, chaining it to the current head.
    pub fn append(
        &self,
        timestamp: u64,
        kind: AuditKind,
        subject_id: &str,
        actor: &str,
        payload: serde_json::Value,
    ) -> AuditEvent {
        let mut chain = lock_unpoisoned(&self.inner);
        let seq = chain.events.len() as u64 + 1;
        let prev_hash = chain.last_hash.clone();
        let hash = event_hash(seq, timestamp, kind, subject_id, actor, &payload, &prev_hash);

        let event = AuditEvent {
            seq,
            timestamp,
            kind,
            subject_id: subject_id.to_string(),
            actor: actor.to_string(),
            payload,
            prev_hash,
            hash: hash.clone(),
        };
        debug!(seq, kind = %kind, subject = %event.subject_id, "Audit event appended");
        chain.last_hash = hash;
        chain.events.push(event.clone());
        event
    }

    /// Walk the chain and report the first inconsistency.
    pub fn verify(&self) -> Result<(), IntegrityError> {
        let chain = lock_unpoisoned(&self.inner);
        let mut expected_prev = ZERO_HASH.to_string();
        for (position, event) in chain.events.iter().enumerate() {
            let expected_seq = position as u64 + 1;
            if event.seq != expected_seq {
                return Err(IntegrityError::SequenceGap {
                    position,
                    found: event.seq,
                    expected: expected_seq,
                });
            }
            if event.prev_hash != expected_prev {
                return Err(IntegrityError::BrokenLink {
                    seq: event.seq,
                    found: event.prev_hash.clone(),
                    expected: expected_prev,
                });
            }
            let computed = event_hash(
                event.seq,
                event.timestamp,
                event.kind,
                &event.subject_id,
                &event.actor,
                &event.payload,
                &event.prev_hash,
            );
            if computed != event.hash {
                return Err(IntegrityError::HashMismatch {
                    seq: event.seq,
                    stored: event.hash.clone(),
                    computed,
                });
            }
            expected_prev = event.hash.clone();
        }
        Ok(())
    }

    /// Ordered snapshot of the full chain.
    pub fn events(&self) -> Vec<AuditEvent> {
        lock_unpoisoned(&self.inner).events.clone()
    }

    /// Events for one subject, in chain order.
    pub fn events_for(&self, subject_id: &str) -> Vec<AuditEvent> {
        lock_unpoisoned(&self.inner)
            .events
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.inner).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export the chain as an ordered JSON array.
    pub fn export_json(&self) -> String {
        let chain = lock_unpoisoned(&self.inner);
        serde_json::to_string(&chain.events).unwrap_or_else(|_| "[]".to_string())
    }

    /// Export the chain as RFC 4180 CSV, header row first.
    pub fn export_csv(&self) -> String {
        let chain = lock_unpoisoned(&self.inner);
        let mut out = String::from("seq,timestamp,kind,subjectId,actor,payloadJson,prevHash,hash\n");
        for event in &chain.events {
            let payload_json =
                serde_json::to_string(&event.payload).unwrap_or_else(|_| "null".to_string());
            let row = [
                event.seq.to_string(),
                event.timestamp.to_string(),
                event.kind.to_string(),
                event.subject_id.clone(),
                event.actor.clone(),
                payload_json,
                event.prev_hash.clone(),
                event.hash.clone(),
            ];
            let mut first = true;
            for field in row {
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(&csv_quote(&field));
            }
            out.push('\n');
        }
        out
    }

    /// Start a fresh chain (seq 1, zero prev hash). The reset itself is the
    /// outer system's responsibility to audit; this chain never records it.
    pub fn reset(&self) {
        let mut chain = lock_unpoisoned(&self.inner);
        chain.events.clear();
        chain.last_hash = ZERO_HASH.to_string();
    }
}

/// md5 over the canonical field concatenation.
fn event_hash(
    seq: u64,
    timestamp: u64,
    kind: AuditKind,
    subject_id: &str,
    actor: &str,
    payload: &serde_json::Value,
    prev_hash: &str,
) -> String {
    let canonical_payload = canonical_json(payload);
    let material =
        format!("{seq}|{timestamp}|{kind}|{subject_id}|{actor}|{canonical_payload}|{prev_hash}");
    format!("{:x}", md5::compute(material.as_bytes()))
}

/// Stable rendering: objects with sorted keys, no insignificant whitespace.
///
/// Spelled out rather than relying on `serde_json`'s map ordering so the
/// canonical form cannot change under a `preserve_order` feature unification.
pub fn canonical_json(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// RFC 4180: quote fields containing comma, quote, or newline; double quotes.
fn csv_quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// A poisoned audit mutex means a panic mid-append; the chain itself is
/// still structurally intact, so continue with the inner value.
fn lock_unpoisoned(mutex: &Mutex<Chain>) -> std::sync::MutexGuard<'_, Chain> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
