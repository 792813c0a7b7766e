//! Core data model: samples, features, verdicts, alerts.
//!
//! Everything here is a fixed record or tagged variant with serde derives;
//! dynamic shapes from upstream sensor gateways are normalized at the ingest
//! boundary.

mod alert;
mod features;
mod sample;
mod verdict;

pub use alert::{
    channels_for_severity, recommended_actions, Alert, AlertFeedback, AlertStatus,
    NotificationChannel, NotificationRecord, NotificationStatus,
};
pub use features::{FeatureVector, MODEL_FEATURE_NAMES};
pub use sample::{
    RawSample, ValvePosition, FLOW_MAX_LPM, FLOW_MIN_LPM, PRESSURE_MAX_PSI, PRESSURE_MIN_PSI,
};
pub use verdict::{AnomalyScore, DetectionResult, LeakRule, RuleVerdict, Severity};
