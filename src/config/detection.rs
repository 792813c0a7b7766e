//! Detection engine configuration structs.
//!
//! Every field has a documented default so a missing or partial TOML file
//! yields a fully working engine. Components receive their sub-config by
//! value at construction; nothing reads a global.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the detection engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    pub preprocess: PreprocessConfig,
    pub rules: RuleConfig,
    pub model: ModelConfig,
    pub fusion: FusionConfig,
    pub alerts: AlertConfig,
    pub pipeline: PipelineConfig,
}

/// Preprocessor (feature extraction) tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Moving-average window (seconds). Default 30.
    pub ma_window_sec: u64,
    /// Standard-deviation window (seconds). Default 60.
    pub std_window_sec: u64,
    /// Spike threshold in σ units. Default 2.0.
    pub spike_z: f64,
    /// Ring capacity per signal per location. Default 600 points, which
    /// covers the 300 s rule window at 1 Hz with 2x margin.
    pub ring_capacity: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            ma_window_sec: 30,
            std_window_sec: 60,
            spike_z: 2.0,
            ring_capacity: 600,
        }
    }
}

/// Rule-engine thresholds (fractions, not percent).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuleConfig {
    /// CRITICAL_LEAK: pressure drop fraction within the critical window. Default 0.15.
    pub critical_drop_pct: f64,
    /// CRITICAL_LEAK window (seconds). Default 60.
    pub critical_window_sec: u64,
    /// MINOR_LEAK: lower drop bound. Default 0.05.
    pub minor_low_pct: f64,
    /// MINOR_LEAK: upper drop bound. Default 0.15.
    pub minor_high_pct: f64,
    /// MINOR_LEAK window (seconds). Default 300.
    pub minor_window_sec: u64,
    /// FLOW_PRESSURE_MISMATCH: flow increase between consecutive samples. Default 0.25.
    pub flow_inc_pct: f64,
    /// FLOW_PRESSURE_MISMATCH: pressure decrease between consecutive samples. Default 0.02.
    pub press_dec_pct: f64,
    /// RATIO_ANOMALY: deviation from baseline ratio. Default 0.30.
    pub ratio_dev_pct: f64,
    /// Bounded rule-engine history length (samples). Default 200.
    pub history_len: usize,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            critical_drop_pct: 0.15,
            critical_window_sec: 60,
            minor_low_pct: 0.05,
            minor_high_pct: 0.15,
            minor_window_sec: 300,
            flow_inc_pct: 0.25,
            press_dec_pct: 0.02,
            ratio_dev_pct: 0.30,
            history_len: 200,
        }
    }
}

/// Isolation-forest hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of trees. Default 100.
    pub num_trees: usize,
    /// Subsample size per tree. Default 256.
    pub subsample: usize,
    /// Training seed; None draws a random seed per training run.
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_trees: 100,
            subsample: 256,
            seed: None,
        }
    }
}

/// Fusion and alert-emission policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    /// Consecutive ML-only anomalies required before an alert. Default 3.
    pub hysteresis_consecutive: u32,
    /// Fused probability at which a result counts as a leak. Default 50.
    pub alert_threshold: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            hysteresis_consecutive: 3,
            alert_threshold: 50.0,
        }
    }
}

/// Alert manager and boundary-call tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertConfig {
    /// Per-call timeout for notification sends and actuator commands (ms).
    /// Default 2000.
    pub notify_timeout_ms: u64,
    /// Maximum concurrent background notification sends. Default 16.
    pub max_concurrent_sends: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            notify_timeout_ms: 2000,
            max_concurrent_sends: 16,
        }
    }
}

/// What to do when the ingest queue is full.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Apply backpressure to the producer.
    #[default]
    Block,
    /// Drop the sample and increment a metric.
    Drop,
}

/// Orchestrator sizing and shutdown behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of ingest workers. Locations are hash-partitioned across
    /// workers, so per-location ordering holds at any count. Default 1.
    pub ingest_workers: usize,
    /// Bounded ingest queue capacity per worker. Default 1024.
    pub ingest_queue_cap: usize,
    /// Producer-side policy when the ingest queue is full.
    pub ingest_overflow: OverflowPolicy,
    /// Drain grace on shutdown before workers are aborted (ms). Default 5000.
    pub shutdown_grace_ms: u64,
    /// Per-subscriber fan-out queue capacity. Default 256.
    pub fanout_queue_cap: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest_workers: 1,
            ingest_queue_cap: 1024,
            ingest_overflow: OverflowPolicy::Block,
            shutdown_grace_ms: 5000,
            fanout_queue_cap: 256,
        }
    }
}
