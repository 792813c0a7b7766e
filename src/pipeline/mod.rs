//! Pipeline orchestration: worker wiring and engine lifecycle.

mod engine;

pub use engine::{DetectionEngine, EngineBuilder, EngineStats};
