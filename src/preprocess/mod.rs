//! Sample validation and feature extraction.
//!
//! The preprocessor is the single gate between raw sensor input and the
//! detectors. It rejects malformed samples with a typed error, substitutes
//! ingest time for a missing sensor timestamp (with a quality penalty), and
//! computes the engineered features both detectors consume.
//!
//! State is partitioned by location: each location owns its own signal rings
//! and last-sample memory, so a single pipeline worker can process its
//! location partition without locks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, TimeZone, Timelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::buffer::SignalWindow;
use crate::clock::Clock;
use crate::config::PreprocessConfig;
use crate::types::{
    FeatureVector, RawSample, FLOW_MAX_LPM, FLOW_MIN_LPM, PRESSURE_MAX_PSI, PRESSURE_MIN_PSI,
};

/// Plausibility window for the optional thermal probe (°C). Readings outside
/// count as an out-of-bounds quality flag but do not reject the sample.
const TEMP_PLAUSIBLE_C: (f64, f64) = (-20.0, 120.0);

/// Why a sample was rejected at the ingest boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Field {field} is not a finite number")]
    NonFinite { field: &'static str },

    #[error("Field {field} out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Stale timestamp for location {location}: {timestamp} < last accepted {last_accepted}")]
    StaleTimestamp {
        location: String,
        timestamp: u64,
        last_accepted: u64,
    },
}

/// Per-location sliding state.
#[derive(Debug)]
struct LocationState {
    pressure: SignalWindow,
    flow: SignalWindow,
    last_timestamp: u64,
    last_pressure: f64,
    last_flow: f64,
    last_temperature: Option<f64>,
}

impl LocationState {
    fn new(ring_capacity: usize) -> Self {
        Self {
            pressure: SignalWindow::new(ring_capacity),
            flow: SignalWindow::new(ring_capacity),
            last_timestamp: 0,
            last_pressure: 0.0,
            last_flow: 0.0,
            last_temperature: None,
        }
    }
}

/// Validates raw samples and produces feature vectors.
pub struct Preprocessor {
    cfg: PreprocessConfig,
    clock: Arc<dyn Clock>,
    locations: HashMap<String, LocationState>,
    accepted: u64,
    rejected: u64,
}

impl Preprocessor {
    pub fn new(cfg: PreprocessConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            clock,
            locations: HashMap::new(),
            accepted: 0,
            rejected: 0,
        }
    }

    /// Validate a sample and compute its feature vector.
    ///
    /// Every rejection increments the rejected counter; nothing is dropped
    /// silently.
    pub fn process(&mut self, sample: RawSample) -> Result<FeatureVector, ValidationError> {
        if let Err(e) = validate_bounds(&sample) {
            self.rejected += 1;
            return Err(e);
        }

        // Timestamp resolution: absent sensor clock → ingest time + penalty.
        let mut other_issues = 0_u32;
        let timestamp = match sample.timestamp {
            Some(ts) => ts,
            None => {
                other_issues += 1;
                self.clock.now_ms()
            }
        };

        let key = sample.location_key().to_string();
        let ring_capacity = self.cfg.ring_capacity;
        let state = self
            .locations
            .entry(key.clone())
            .or_insert_with(|| LocationState::new(ring_capacity));

        if !state.pressure.is_empty() && timestamp < state.last_timestamp {
            self.rejected += 1;
            return Err(ValidationError::StaleTimestamp {
                location: key,
                timestamp,
                last_accepted: state.last_timestamp,
            });
        }

        // Rates of change against the previous accepted sample.
        let dt_sec = if state.pressure.is_empty() {
            0.0
        } else {
            (timestamp - state.last_timestamp) as f64 / 1000.0
        };
        let rate = |current: f64, previous: f64| -> f64 {
            if dt_sec > 0.0 {
                (current - previous) / dt_sec
            } else {
                0.0
            }
        };
        let pressure_roc = rate(sample.pressure, state.last_pressure);
        let flow_roc = rate(sample.flow, state.last_flow);
        let temperature_roc = match (sample.temperature, state.last_temperature) {
            (Some(cur), Some(prev)) => rate(cur, prev),
            _ => 0.0,
        };

        state.pressure.push(timestamp, sample.pressure);
        state.flow.push(timestamp, sample.flow);

        let ma_cutoff = timestamp.saturating_sub(self.cfg.ma_window_sec * 1000);
        let std_cutoff = timestamp.saturating_sub(self.cfg.std_window_sec * 1000);

        let windowed = |window: &SignalWindow, cutoff: u64| {
            window
                .stats_since(cutoff)
                .filter(|stats| stats.count >= 3)
        };

        let pressure_ma = windowed(&state.pressure, ma_cutoff).map(|s| s.mean);
        let flow_ma = windowed(&state.flow, ma_cutoff).map(|s| s.mean);
        let pressure_60 = windowed(&state.pressure, std_cutoff);
        let flow_60 = windowed(&state.flow, std_cutoff);

        let spike = |value: f64, stats: Option<crate::buffer::WindowStats>| -> bool {
            stats.is_some_and(|s| {
                s.std_dev > 0.0 && ((value - s.mean).abs() / s.std_dev) > self.cfg.spike_z
            })
        };
        let pressure_spike = spike(sample.pressure, pressure_60);
        let flow_spike = spike(sample.flow, flow_60);

        // Soft quality flags: implausible optional channels cost 0.2 each,
        // a substituted timestamp cost 0.1 (counted above).
        let mut oob_flags = 0_u32;
        if let Some(t) = sample.temperature {
            if !t.is_finite() || t < TEMP_PLAUSIBLE_C.0 || t > TEMP_PLAUSIBLE_C.1 {
                oob_flags += 1;
            }
        }
        if let Some(c) = sample.conductivity {
            if !c.is_finite() || c < 0.0 {
                oob_flags += 1;
            }
        }
        let data_quality =
            (1.0 - 0.2 * f64::from(oob_flags) - 0.1 * f64::from(other_issues)).clamp(0.0, 1.0);

        let (hour_of_day, day_of_week, is_weekend) = time_of_day_features(timestamp);

        state.last_timestamp = timestamp;
        state.last_pressure = sample.pressure;
        state.last_flow = sample.flow;
        state.last_temperature = sample.temperature;

        self.accepted += 1;
        debug!(
            location = %key,
            timestamp,
            pressure = sample.pressure,
            flow = sample.flow,
            quality = data_quality,
            "Sample accepted"
        );

        let pf_ratio = sample.pressure_flow_ratio();
        let mut sample = sample;
        sample.timestamp = Some(timestamp);

        Ok(FeatureVector {
            sample,
            timestamp,
            pressure_roc,
            flow_roc,
            temperature_roc,
            pressure_ma,
            flow_ma,
            pressure_std: pressure_60.map(|s| s.std_dev),
            flow_std: flow_60.map(|s| s.std_dev),
            pf_ratio,
            pressure_spike,
            flow_spike,
            hour_of_day,
            day_of_week,
            is_weekend,
            data_quality,
        })
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    /// Drop all per-location state (used on engine reset).
    pub fn reset(&mut self) {
        self.locations.clear();
    }
}

/// Stateless structural checks, shared with the ingest boundary so `submit`
/// can reject synchronously before enqueueing.
pub fn validate_bounds(sample: &RawSample) -> Result<(), ValidationError> {
    if !sample.pressure.is_finite() {
        return Err(ValidationError::NonFinite { field: "pressure" });
    }
    if !sample.flow.is_finite() {
        return Err(ValidationError::NonFinite { field: "flow" });
    }
    if sample.pressure < PRESSURE_MIN_PSI || sample.pressure > PRESSURE_MAX_PSI {
        return Err(ValidationError::OutOfRange {
            field: "pressure",
            value: sample.pressure,
            min: PRESSURE_MIN_PSI,
            max: PRESSURE_MAX_PSI,
        });
    }
    if sample.flow < FLOW_MIN_LPM || sample.flow > FLOW_MAX_LPM {
        return Err(ValidationError::OutOfRange {
            field: "flow",
            value: sample.flow,
            min: FLOW_MIN_LPM,
            max: FLOW_MAX_LPM,
        });
    }
    Ok(())
}

/// UTC hour / weekday / weekend flags from a millisecond timestamp.
fn time_of_day_features(timestamp_ms: u64) -> (u8, u8, bool) {
    match Utc.timestamp_millis_opt(timestamp_ms as i64).single() {
        Some(dt) => {
            let hour = dt.hour() as u8;
            let dow = dt.weekday().num_days_from_monday() as u8;
            (hour, dow, dow >= 5)
        }
        None => (0, 0, false),
    }
}
