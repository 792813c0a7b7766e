//! Deterministic rule engine.
//!
//! Five threshold rules over a bounded sample history:
//!
//! | Rule | Condition |
//! |---|---|
//! | CRITICAL_LEAK | pressure drop > 15 % within any 60 s window |
//! | MINOR_LEAK | pressure drop in [5 %, 15 %] within any 300 s window |
//! | FLOW_PRESSURE_MISMATCH | flow +25 % and pressure −2 % between consecutive samples |
//! | RATIO_ANOMALY | P/F ratio deviates > 30 % from the operator baseline |
//! | SPIKE_ANOMALY | pressure or flow spike flag set |
//!
//! Fired probabilities are summed, a compounding bonus of `min(20, 5 × n)` is
//! added, and the total is capped at 100. Every rule records its computed
//! inputs in the verdict's detail map so operators can see exactly why (or
//! why not) it fired.

use std::collections::BTreeMap;

use serde_json::json;
use tracing::debug;

use crate::buffer::SignalWindow;
use crate::config::RuleConfig;
use crate::types::{FeatureVector, LeakRule, RuleVerdict, Severity};

/// Maximum compounding bonus for multiple fired rules.
const COMPOUND_BONUS_CAP: f64 = 20.0;
/// Bonus per fired rule.
const COMPOUND_BONUS_PER_RULE: f64 = 5.0;
/// Rule-engine local leak threshold (probability).
const RULE_LEAK_THRESHOLD: f64 = 50.0;
/// Metering floor below which ratio rules are suppressed (L/min).
const RATIO_FLOW_FLOOR: f64 = 0.1;

/// Evaluates the five leak rules against a bounded history.
///
/// The engine owns its own history (independent of the preprocessor rings) so
/// `reset()` and baseline changes never disturb feature extraction.
pub struct RuleEngine {
    cfg: RuleConfig,
    pressure: SignalWindow,
    flow: SignalWindow,
    /// Previous evaluated sample, for the consecutive-sample mismatch rule.
    prev: Option<(f64, f64)>,
    /// Operator baseline (pressure, flow) for ratio rules.
    baseline: Option<(f64, f64)>,
    evaluations: u64,
}

impl RuleEngine {
    pub fn new(cfg: RuleConfig) -> Self {
        let history = cfg.history_len;
        Self {
            cfg,
            pressure: SignalWindow::new(history),
            flow: SignalWindow::new(history),
            prev: None,
            baseline: None,
            evaluations: 0,
        }
    }

    /// Install the reference (pressure, flow) pair for ratio-based rules.
    pub fn set_baseline(&mut self, pressure: f64, flow: f64) {
        debug!(pressure, flow, "Rule baseline set");
        self.baseline = Some((pressure, flow));
    }

    pub fn baseline(&self) -> Option<(f64, f64)> {
        self.baseline
    }

    /// Clear history, previous-sample memory, and the baseline.
    pub fn reset(&mut self) {
        self.pressure.clear();
        self.flow.clear();
        self.prev = None;
        self.baseline = None;
    }

    /// Evaluate all rules against one feature vector.
    pub fn evaluate(&mut self, features: &FeatureVector) -> RuleVerdict {
        self.evaluations += 1;
        let ts = features.timestamp;
        let cur_pressure = features.sample.pressure;
        let cur_flow = features.sample.flow;

        let mut fired: Vec<LeakRule> = Vec::new();
        let mut details: BTreeMap<String, serde_json::Value> = BTreeMap::new();

        // CRITICAL_LEAK — sharp drop against the 60 s window peak.
        let critical_cutoff = ts.saturating_sub(self.cfg.critical_window_sec * 1000);
        let critical_drop = self.window_drop(cur_pressure, critical_cutoff);
        if let Some((drop, peak, count)) = critical_drop {
            details.insert(
                LeakRule::CriticalLeak.name().to_string(),
                json!({
                    "window_sec": self.cfg.critical_window_sec,
                    "window_peak": peak,
                    "current": cur_pressure,
                    "drop_pct": drop,
                    "threshold_pct": self.cfg.critical_drop_pct,
                    "samples": count,
                }),
            );
            if drop > self.cfg.critical_drop_pct {
                fired.push(LeakRule::CriticalLeak);
            }
        }

        // MINOR_LEAK — gradual drop against the 300 s window peak.
        let minor_cutoff = ts.saturating_sub(self.cfg.minor_window_sec * 1000);
        if let Some((drop, peak, count)) = self.window_drop(cur_pressure, minor_cutoff) {
            details.insert(
                LeakRule::MinorLeak.name().to_string(),
                json!({
                    "window_sec": self.cfg.minor_window_sec,
                    "window_peak": peak,
                    "current": cur_pressure,
                    "drop_pct": drop,
                    "low_pct": self.cfg.minor_low_pct,
                    "high_pct": self.cfg.minor_high_pct,
                    "samples": count,
                }),
            );
            if drop >= self.cfg.minor_low_pct && drop <= self.cfg.minor_high_pct {
                fired.push(LeakRule::MinorLeak);
            }
        }

        // FLOW_PRESSURE_MISMATCH — divergence between consecutive samples.
        if let Some((prev_pressure, prev_flow)) = self.prev {
            let flow_inc = if prev_flow > 0.0 {
                (cur_flow - prev_flow) / prev_flow
            } else {
                0.0
            };
            let press_dec = if prev_pressure > 0.0 {
                (prev_pressure - cur_pressure) / prev_pressure
            } else {
                0.0
            };
            details.insert(
                LeakRule::FlowPressureMismatch.name().to_string(),
                json!({
                    "prev_pressure": prev_pressure,
                    "prev_flow": prev_flow,
                    "flow_increase_pct": flow_inc,
                    "pressure_decrease_pct": press_dec,
                    "flow_threshold_pct": self.cfg.flow_inc_pct,
                    "pressure_threshold_pct": self.cfg.press_dec_pct,
                }),
            );
            if flow_inc > self.cfg.flow_inc_pct && press_dec > self.cfg.press_dec_pct {
                fired.push(LeakRule::FlowPressureMismatch);
            }
        }

        // RATIO_ANOMALY — only meaningful with a baseline and measurable flow.
        if let Some((base_p, base_f)) = self.baseline {
            if cur_flow >= RATIO_FLOW_FLOOR && base_f >= RATIO_FLOW_FLOOR {
                let base_ratio = base_p / base_f;
                let cur_ratio = cur_pressure / cur_flow;
                let deviation = if base_ratio.abs() > f64::EPSILON {
                    (cur_ratio - base_ratio).abs() / base_ratio
                } else {
                    0.0
                };
                details.insert(
                    LeakRule::RatioAnomaly.name().to_string(),
                    json!({
                        "baseline_ratio": base_ratio,
                        "current_ratio": cur_ratio,
                        "deviation_pct": deviation,
                        "threshold_pct": self.cfg.ratio_dev_pct,
                    }),
                );
                if deviation > self.cfg.ratio_dev_pct {
                    fired.push(LeakRule::RatioAnomaly);
                }
            }
        }

        // SPIKE_ANOMALY — preprocessor z-score flags.
        details.insert(
            LeakRule::SpikeAnomaly.name().to_string(),
            json!({
                "pressure_spike": features.pressure_spike,
                "flow_spike": features.flow_spike,
            }),
        );
        if features.pressure_spike || features.flow_spike {
            fired.push(LeakRule::SpikeAnomaly);
        }

        // Record history after evaluation so a rule never compares the
        // current sample against itself.
        self.pressure.push(ts, cur_pressure);
        self.flow.push(ts, cur_flow);
        self.prev = Some((cur_pressure, cur_flow));

        let verdict = combine(&fired, details);
        if verdict.triggered {
            debug!(
                probability = verdict.probability,
                severity = %verdict.severity,
                rules = ?verdict.fired_rules,
                "Rule verdict triggered"
            );
        }
        verdict
    }

    pub fn evaluation_count(&self) -> u64 {
        self.evaluations
    }

    /// Drop fraction of `current` vs the window peak, with sample count.
    /// None when the window holds fewer than 2 points (no peak to compare
    /// against) or the peak is non-positive.
    fn window_drop(&self, current: f64, cutoff_ms: u64) -> Option<(f64, f64, usize)> {
        let (peak, count) = self.pressure.peak_since(cutoff_ms)?;
        if count < 2 || peak <= 0.0 {
            return None;
        }
        Some(((peak - current) / peak, peak, count))
    }
}

/// Sum fired base probabilities, add the compounding bonus, pick severity.
fn combine(fired: &[LeakRule], details: BTreeMap<String, serde_json::Value>) -> RuleVerdict {
    if fired.is_empty() {
        return RuleVerdict {
            triggered: false,
            probability: 0.0,
            severity: Severity::Normal,
            fired_rules: Vec::new(),
            details,
            is_leak: false,
        };
    }

    let base_sum: f64 = fired.iter().map(|r| r.base_probability()).sum();
    let bonus = (COMPOUND_BONUS_PER_RULE * fired.len() as f64).min(COMPOUND_BONUS_CAP);
    let probability = (base_sum + bonus).min(100.0);

    // Max severity; the enum ordering matches the rule table's tie-break.
    let severity = fired
        .iter()
        .map(|r| r.severity())
        .max()
        .unwrap_or(Severity::Normal);

    RuleVerdict {
        triggered: true,
        probability,
        severity,
        fired_rules: fired.to_vec(),
        details,
        is_leak: probability >= RULE_LEAK_THRESHOLD,
    }
}
