//! Engine configuration loaded from TOML.
//!
//! ## Loading order
//!
//! 1. `PIPESENTRY_CONFIG` environment variable (path to TOML file)
//! 2. `pipesentry.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The loaded `DetectionConfig` is handed to `DetectionEngine::start` and
//! threaded down to components by value; there is no process-wide global, so
//! tests can run engines with different configurations side by side.

mod detection;

pub use detection::{
    AlertConfig, DetectionConfig, FusionConfig, ModelConfig, OverflowPolicy, PipelineConfig,
    PreprocessConfig, RuleConfig,
};

use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Errors raised when an explicit config file cannot be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
}

impl DetectionConfig {
    /// Load configuration using the documented search order, falling back to
    /// defaults on any failure (a bad optional file is a warning, not an
    /// abort).
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("PIPESENTRY_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from PIPESENTRY_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load PIPESENTRY_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "PIPESENTRY_CONFIG points to a non-existent file, falling back");
            }
        }

        let local = PathBuf::from("pipesentry.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./pipesentry.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./pipesentry.toml, using defaults");
                }
            }
        }

        info!("No pipesentry.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}
