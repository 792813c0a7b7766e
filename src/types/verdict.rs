//! Detector verdict types: Severity, RuleVerdict, AnomalyScore, DetectionResult

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{FeatureVector, RawSample};

/// Leak severity, ordered from benign to critical.
///
/// This is the single severity vocabulary used across the engine; notification
/// routing and valve-closure policy key off it.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[default]
    Normal,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Normal => write!(f, "NORMAL"),
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Identifier of a deterministic leak rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeakRule {
    CriticalLeak,
    MinorLeak,
    FlowPressureMismatch,
    RatioAnomaly,
    SpikeAnomaly,
}

impl LeakRule {
    pub const fn name(self) -> &'static str {
        match self {
            LeakRule::CriticalLeak => "CRITICAL_LEAK",
            LeakRule::MinorLeak => "MINOR_LEAK",
            LeakRule::FlowPressureMismatch => "FLOW_PRESSURE_MISMATCH",
            LeakRule::RatioAnomaly => "RATIO_ANOMALY",
            LeakRule::SpikeAnomaly => "SPIKE_ANOMALY",
        }
    }

    /// Base probability contribution when the rule fires.
    pub const fn base_probability(self) -> f64 {
        match self {
            LeakRule::CriticalLeak => 85.0,
            LeakRule::MinorLeak => 50.0,
            LeakRule::FlowPressureMismatch => 70.0,
            LeakRule::RatioAnomaly => 45.0,
            LeakRule::SpikeAnomaly => 35.0,
        }
    }

    /// Severity assigned when the rule fires.
    pub const fn severity(self) -> Severity {
        match self {
            LeakRule::CriticalLeak => Severity::Critical,
            LeakRule::MinorLeak => Severity::Medium,
            LeakRule::FlowPressureMismatch => Severity::High,
            LeakRule::RatioAnomaly => Severity::Medium,
            LeakRule::SpikeAnomaly => Severity::Low,
        }
    }
}

impl std::fmt::Display for LeakRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Verdict of the deterministic rule engine for one feature vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleVerdict {
    /// True when at least one rule fired.
    pub triggered: bool,
    /// Combined probability in [0,100].
    pub probability: f64,
    /// Highest severity across fired rules (table order breaks ties).
    pub severity: Severity,
    /// Rules that fired, in evaluation order.
    pub fired_rules: Vec<LeakRule>,
    /// Per-rule computed inputs so the verdict is explainable. Keyed by rule
    /// name; present for every evaluated rule, fired or not.
    pub details: BTreeMap<String, serde_json::Value>,
    /// Local rule-engine leak call (probability >= 50). The fused decision
    /// lives in the detection result.
    pub is_leak: bool,
}

impl RuleVerdict {
    /// A verdict with nothing fired (used before history warms up).
    pub fn quiet() -> Self {
        Self {
            triggered: false,
            probability: 0.0,
            severity: Severity::Normal,
            fired_rules: Vec::new(),
            details: BTreeMap::new(),
            is_leak: false,
        }
    }
}

/// Isolation-forest score for one feature vector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnomalyScore {
    /// Normalized anomaly score in [0,1]; higher is more anomalous.
    pub score: f64,
    /// True when score > 0.5.
    pub is_anomaly: bool,
    /// Distance from the decision boundary, |score - 0.5| × 2, in [0,1].
    pub confidence: f64,
}

impl AnomalyScore {
    pub fn from_score(score: f64) -> Self {
        Self {
            score,
            is_anomaly: score > 0.5,
            confidence: (score - 0.5).abs() * 2.0,
        }
    }
}

/// Fused output of both detectors for one sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Process-unique detection id ("DET-<seq>").
    pub id: String,
    /// Timestamp of the underlying sample (ms since epoch).
    pub timestamp: u64,
    /// The accepted sample.
    pub sample: RawSample,
    /// The engineered features.
    pub features: FeatureVector,
    /// Rule-engine verdict.
    pub rule: RuleVerdict,
    /// Anomaly-model score; None while the model is untrained.
    pub ml: Option<AnomalyScore>,
    /// Fused leak probability in [0,100].
    pub probability: f64,
    /// Fused severity.
    pub severity: Severity,
    /// Fused confidence in [0,100].
    pub confidence: f64,
    /// Fused leak call (probability >= alert threshold).
    pub is_leak: bool,
}
