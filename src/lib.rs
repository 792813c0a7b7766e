//! PipeSentry: real-time leak detection for pressurized fluid networks.
//!
//! ## Architecture
//!
//! - **Preprocessor**: validation and engineered features per sample
//! - **Rule Engine**: five deterministic threshold rules with explainable verdicts
//! - **Anomaly Model**: Isolation Forest (seeded training, lock-free scoring)
//! - **Fusion**: rule + ML combination with per-location ML hysteresis
//! - **Alert Manager**: lifecycle, notification fan-out, valve closure, audit
//! - **Audit Log**: append-only hash-chained event store
//! - **Fan-out Hub**: bounded per-subscriber queues for live clients
//! - **Pipeline**: ingest workers wiring the above, one per location partition

pub mod actuator;
pub mod alerts;
pub mod audit;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod fanout;
pub mod forest;
pub mod fusion;
pub mod pipeline;
pub mod preprocess;
pub mod rules;
pub mod store;
pub mod types;

// Re-export configuration
pub use config::DetectionConfig;

// Re-export commonly used types
pub use types::{
    Alert, AlertFeedback, AlertStatus, AnomalyScore, DetectionResult, FeatureVector, LeakRule,
    RawSample, RuleVerdict, Severity, ValvePosition,
};

// Re-export component surfaces
pub use alerts::{AlertError, AlertManager, AlertQuery, AlertStatistics};
pub use audit::{AuditEvent, AuditKind, AuditLog, IntegrityError};
pub use fanout::{FanoutHub, Subscription, Topic};
pub use forest::{IsolationForest, Label, ModelError, SharedModel, TrainingReport, TrainingSet};
pub use pipeline::{DetectionEngine, EngineBuilder, EngineStats};
pub use preprocess::{Preprocessor, ValidationError};
pub use rules::RuleEngine;
