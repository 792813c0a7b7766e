//! Engineered feature vector produced by the preprocessor

use serde::{Deserialize, Serialize};

use super::RawSample;

/// Names of the numeric features fed to the anomaly model, in schema order.
///
/// The order here is the canonical feature order for training and scoring;
/// `FeatureVector::model_features` emits pairs in exactly this order.
pub const MODEL_FEATURE_NAMES: [&str; 11] = [
    "pressure",
    "flow",
    "pressure_roc",
    "flow_roc",
    "pressure_ma",
    "flow_ma",
    "pressure_std",
    "flow_std",
    "pf_ratio",
    "hour_of_day",
    "is_weekend",
];

/// Enrichment of a `RawSample` with derived features.
///
/// Produced once per accepted sample, published on `sensor.update`, consumed
/// by both detectors, and discarded after the detection result is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    /// The accepted sample (timestamp resolved if it was missing).
    pub sample: RawSample,
    /// Resolved timestamp in ms since epoch; always present post-validation.
    pub timestamp: u64,

    // === Rates of change (unit/second) ===
    /// Pressure delta over wall time vs the previous accepted sample.
    pub pressure_roc: f64,
    /// Flow delta over wall time vs the previous accepted sample.
    pub flow_roc: f64,
    /// Temperature delta over wall time (0 when no thermal probe).
    pub temperature_roc: f64,

    // === Moving statistics ===
    /// 30 s moving average of pressure; None with fewer than 3 samples.
    pub pressure_ma: Option<f64>,
    /// 30 s moving average of flow; None with fewer than 3 samples.
    pub flow_ma: Option<f64>,
    /// 60 s population standard deviation of pressure; None below 3 samples.
    pub pressure_std: Option<f64>,
    /// 60 s population standard deviation of flow; None below 3 samples.
    pub flow_std: Option<f64>,

    /// Pressure/flow ratio, 0 when flow < 0.1 L/min.
    pub pf_ratio: f64,

    // === Spike flags (|z| > configured threshold against the 60 s window) ===
    pub pressure_spike: bool,
    pub flow_spike: bool,

    // === Time-of-day features (UTC) ===
    /// Hour of day, 0-23.
    pub hour_of_day: u8,
    /// Day of week, 0 = Monday .. 6 = Sunday.
    pub day_of_week: u8,
    pub is_weekend: bool,

    /// Data quality score in [0,1]; 1.0 is a fully clean sample.
    pub data_quality: f64,
}

impl FeatureVector {
    /// Flatten to named model features in `MODEL_FEATURE_NAMES` order.
    ///
    /// A still-null moving average feeds the current value (a zero-information
    /// delta for the model); a null σ feeds 0.
    pub fn model_features(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("pressure", self.sample.pressure),
            ("flow", self.sample.flow),
            ("pressure_roc", self.pressure_roc),
            ("flow_roc", self.flow_roc),
            ("pressure_ma", self.pressure_ma.unwrap_or(self.sample.pressure)),
            ("flow_ma", self.flow_ma.unwrap_or(self.sample.flow)),
            ("pressure_std", self.pressure_std.unwrap_or(0.0)),
            ("flow_std", self.flow_std.unwrap_or(0.0)),
            ("pf_ratio", self.pf_ratio),
            ("hour_of_day", f64::from(self.hour_of_day)),
            ("is_weekend", if self.is_weekend { 1.0 } else { 0.0 }),
        ]
    }
}
