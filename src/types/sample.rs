//! Raw sensor sample types

use serde::{Deserialize, Serialize};

/// Hard validity bounds for pressure readings (PSI).
pub const PRESSURE_MIN_PSI: f64 = 0.0;
pub const PRESSURE_MAX_PSI: f64 = 100.0;

/// Hard validity bounds for flow readings (L/min).
pub const FLOW_MIN_LPM: f64 = 0.0;
pub const FLOW_MAX_LPM: f64 = 150.0;

/// Reported position of a pipeline valve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValvePosition {
    Open,
    Closed,
    #[default]
    Unknown,
}

impl std::fmt::Display for ValvePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValvePosition::Open => write!(f, "OPEN"),
            ValvePosition::Closed => write!(f, "CLOSED"),
            ValvePosition::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A single raw sensor sample as received at the ingest boundary.
///
/// Immutable once accepted. Pressure and flow are mandatory channels;
/// temperature, conductivity, and location are optional depending on the
/// sensor package installed at the site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSample {
    /// Sample id assigned by the sensor gateway (opaque).
    #[serde(default)]
    pub id: String,
    /// Milliseconds since Unix epoch. Absent when the sensor clock failed;
    /// the preprocessor substitutes ingest time and penalizes quality.
    #[serde(default)]
    pub timestamp: Option<u64>,
    /// Line pressure (PSI), valid range 0-100.
    pub pressure: f64,
    /// Flow rate (L/min), valid range 0-150.
    pub flow: f64,
    /// Valve position reported alongside the hydraulic channels.
    #[serde(default)]
    pub valve_state: ValvePosition,
    /// Fluid temperature (°C), if the site has a thermal probe.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Electrical conductivity (µS/cm), if equipped.
    #[serde(default)]
    pub conductivity: Option<f64>,
    /// Logical network location ("main", "sector-4", ...). Samples without a
    /// location share a single anonymous partition.
    #[serde(default)]
    pub location: Option<String>,
}

impl RawSample {
    /// Location key used for partitioning; anonymous samples share "-".
    pub fn location_key(&self) -> &str {
        self.location.as_deref().unwrap_or("-")
    }

    /// Pressure/flow ratio, 0 when flow is below the metering floor.
    pub fn pressure_flow_ratio(&self) -> f64 {
        if self.flow >= 0.1 {
            self.pressure / self.flow
        } else {
            0.0
        }
    }
}

impl Default for RawSample {
    fn default() -> Self {
        Self {
            id: String::new(),
            timestamp: None,
            pressure: 0.0,
            flow: 0.0,
            valve_state: ValvePosition::Unknown,
            temperature: None,
            conductivity: None,
            location: None,
        }
    }
}
