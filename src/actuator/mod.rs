//! Valve actuator capability.
//!
//! The engine holds the actuator by trait; production deployments supply a
//! SCADA-backed implementation, while the in-crate `SimulatedActuator` backs
//! the simulation binary and tests. Commands are expected to be issued under
//! the caller's per-call timeout.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::types::ValvePosition;

/// Errors from actuator commands.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActuatorError {
    #[error("Actuator rejected command for {location}: {reason}")]
    CommandRejected { location: String, reason: String },

    #[error("Actuator unreachable for {location}")]
    Unreachable { location: String },

    #[error("Actuator command for {location} timed out")]
    Timeout { location: String },
}

/// Remote valve control for a network location.
#[async_trait]
pub trait ValveActuator: Send + Sync {
    /// Close the valve at `location`. `reason` is passed through for the
    /// field system's own logs.
    async fn close(&self, location: &str, reason: &str) -> Result<(), ActuatorError>;

    /// Open the valve at `location`.
    async fn open(&self, location: &str, reason: &str) -> Result<(), ActuatorError>;

    /// Reported valve position; `Unknown` for unmanaged locations.
    async fn state(&self, location: &str) -> ValvePosition;
}

/// In-memory actuator for the simulation binary and tests.
///
/// Locations must be registered before commands succeed; commands against an
/// unregistered location report `Unreachable`, which models a disabled field
/// actuator.
#[derive(Default)]
pub struct SimulatedActuator {
    valves: Mutex<HashMap<String, ValvePosition>>,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a managed location with its initial position.
    pub fn register(&self, location: &str, position: ValvePosition) {
        self.valves
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(location.to_string(), position);
    }

    fn set(&self, location: &str, position: ValvePosition) -> Result<(), ActuatorError> {
        let mut valves = self
            .valves
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match valves.get_mut(location) {
            Some(current) => {
                *current = position;
                Ok(())
            }
            None => Err(ActuatorError::Unreachable {
                location: location.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ValveActuator for SimulatedActuator {
    async fn close(&self, location: &str, reason: &str) -> Result<(), ActuatorError> {
        self.set(location, ValvePosition::Closed)?;
        info!(location, reason, "Simulated valve closed");
        Ok(())
    }

    async fn open(&self, location: &str, reason: &str) -> Result<(), ActuatorError> {
        self.set(location, ValvePosition::Open)?;
        info!(location, reason, "Simulated valve opened");
        Ok(())
    }

    async fn state(&self, location: &str) -> ValvePosition {
        self.valves
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(location)
            .copied()
            .unwrap_or(ValvePosition::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registered_valve_cycles() {
        let actuator = SimulatedActuator::new();
        actuator.register("main", ValvePosition::Open);
        assert_eq!(actuator.state("main").await, ValvePosition::Open);

        actuator.close("main", "leak detected").await.unwrap();
        assert_eq!(actuator.state("main").await, ValvePosition::Closed);

        actuator.open("main", "repair complete").await.unwrap();
        assert_eq!(actuator.state("main").await, ValvePosition::Open);
    }

    #[tokio::test]
    async fn test_unregistered_location_is_unreachable() {
        let actuator = SimulatedActuator::new();
        assert_eq!(actuator.state("ghost").await, ValvePosition::Unknown);
        let err = actuator.close("ghost", "test").await.unwrap_err();
        assert!(matches!(err, ActuatorError::Unreachable { .. }));
    }
}
