//! Fusion of rule and ML verdicts into detection results.
//!
//! The fused probability weighs the deterministic rules at 0.4 and the
//! anomaly model at 0.6. Alert emission is asymmetric by design: a rule hit
//! emits immediately, while an ML-only signal must persist for
//! `hysteresis_consecutive` samples at the same location before it emits.
//! That debounces isolated model blips without slowing the deterministic
//! path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::FusionConfig;
use crate::types::{AnomalyScore, DetectionResult, FeatureVector, RuleVerdict, Severity};

/// Why a decision asked for an alert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertTrigger {
    /// At least one deterministic rule fired.
    Rule,
    /// The ML hysteresis counter reached its threshold.
    MlConsecutive,
}

/// A fused detection plus the emission decision.
#[derive(Debug, Clone)]
pub struct Decision {
    pub result: DetectionResult,
    /// Whether the alert policy accepted this result.
    pub emit_alert: bool,
    /// Set iff `emit_alert`.
    pub trigger: Option<AlertTrigger>,
}

/// Combines detector outputs and applies the per-location alert policy.
///
/// Each pipeline worker owns one decider for its location partition; the
/// detection-id counter is shared across workers so ids stay process-unique.
pub struct FusionDecider {
    cfg: FusionConfig,
    /// Consecutive ML-only anomalies per location.
    ml_consecutive: HashMap<String, u32>,
    /// Shared process-wide detection sequence.
    sequence: Arc<AtomicU64>,
}

impl FusionDecider {
    pub fn new(cfg: FusionConfig, sequence: Arc<AtomicU64>) -> Self {
        Self {
            cfg,
            ml_consecutive: HashMap::new(),
            sequence,
        }
    }

    /// Fuse one sample's verdicts into a detection result and decide whether
    /// it becomes an alert.
    ///
    /// `ml` is None while the model is untrained; fusion then proceeds
    /// rule-only with the rule probability unweighted.
    pub fn decide(
        &mut self,
        features: FeatureVector,
        rule: RuleVerdict,
        ml: Option<AnomalyScore>,
    ) -> Decision {
        let location = features.sample.location_key().to_string();

        let probability = match ml {
            Some(score) => {
                (0.4 * rule.probability + 0.6 * (score.score * 100.0)).min(100.0)
            }
            // Rule-only: scaling by 0.4 would let a 100 % rule hit slip under
            // the alert threshold.
            None => rule.probability,
        };

        let severity = match ml {
            Some(score) if score.is_anomaly && rule.severity == Severity::Normal => {
                Severity::Medium
            }
            _ => rule.severity,
        };

        let rule_component = if rule.triggered { 80.0 } else { 20.0 };
        let confidence = match ml {
            Some(score) => (rule_component + score.confidence * 100.0) / 2.0,
            None => rule_component,
        };

        let is_leak = probability >= self.cfg.alert_threshold;

        // Hysteresis bookkeeping.
        let counter = self.ml_consecutive.entry(location.clone()).or_insert(0);
        let ml_anomalous = ml.is_some_and(|s| s.is_anomaly);
        let (emit_alert, trigger) = if rule.triggered {
            *counter = 0;
            (true, Some(AlertTrigger::Rule))
        } else if ml_anomalous {
            *counter += 1;
            if *counter >= self.cfg.hysteresis_consecutive && is_leak {
                // Reset so a sustained anomaly yields one alert per streak.
                *counter = 0;
                (true, Some(AlertTrigger::MlConsecutive))
            } else {
                (false, None)
            }
        } else {
            *counter = 0;
            (false, None)
        };

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let result = DetectionResult {
            id: format!("DET-{seq}"),
            timestamp: features.timestamp,
            sample: features.sample.clone(),
            rule,
            ml,
            probability,
            severity,
            confidence,
            is_leak,
            features,
        };

        if emit_alert {
            debug!(
                id = %result.id,
                location = %location,
                probability,
                severity = %severity,
                trigger = ?trigger,
                "Alert policy accepted detection"
            );
        }

        Decision {
            result,
            emit_alert,
            trigger,
        }
    }

    /// Current hysteresis counter for a location (testing and diagnostics).
    pub fn ml_consecutive(&self, location: &str) -> u32 {
        self.ml_consecutive.get(location).copied().unwrap_or(0)
    }

    /// Clear all hysteresis counters.
    pub fn reset(&mut self) {
        self.ml_consecutive.clear();
    }
}
