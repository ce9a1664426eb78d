//! Engine configuration
//!
//! All sections default sensibly, so a config file only needs the keys it
//! wants to change. Files are read as YAML (`.yaml`, `.yml`) or JSON (`.json`).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analytics::AnalyticsConfig;
use crate::cache::CacheConfig;
use crate::simulation::SimulationConfig;

/// Node count above which work is moved to the background worker
pub const DEFAULT_WORKER_THRESHOLD: usize = 500;

/// Number of records applied per import batch
pub const DEFAULT_IMPORT_BATCH_SIZE: usize = 50;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// A value is outside its allowed range
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Graphs with more nodes than this run on the background worker
    pub worker_threshold: usize,
    /// Records per import batch
    pub import_batch_size: usize,
    /// Ticks run per `pump` call when the simulation executes inline
    pub ticks_per_frame: usize,
    pub simulation: SimulationConfig,
    pub cache: CacheConfig,
    pub analytics: AnalyticsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threshold: DEFAULT_WORKER_THRESHOLD,
            import_batch_size: DEFAULT_IMPORT_BATCH_SIZE,
            ticks_per_frame: 1,
            simulation: SimulationConfig::default(),
            cache: CacheConfig::default(),
            analytics: AnalyticsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let config: EngineConfig = match ext.as_str() {
            "yaml" | "yml" => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            "json" => {
                serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that every value is in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.import_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "import_batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.ticks_per_frame == 0 {
            return Err(ConfigError::Invalid {
                field: "ticks_per_frame",
                reason: "must be at least 1".to_string(),
            });
        }
        self.simulation.validate()?;
        self.cache.validate()?;
        self.analytics.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_threshold, 500);
        assert_eq!(config.import_batch_size, 50);
        assert_eq!(config.cache.max_cache_size, 1000);
        assert_eq!(config.analytics.damping, 0.85);
    }

    #[test]
    fn loads_partial_yaml() {
        let file = write_temp(
            ".yaml",
            "worker_threshold: 20\nsimulation:\n  alpha_decay: 0.05\ncache:\n  enabled: false\n",
        );
        let config = EngineConfig::load(file.path()).unwrap();

        assert_eq!(config.worker_threshold, 20);
        assert_eq!(config.simulation.alpha_decay, 0.05);
        assert_eq!(
            config.simulation.target_alpha,
            SimulationConfig::default().target_alpha
        );
        assert!(!config.cache.enabled);
    }

    #[test]
    fn loads_json() {
        let file = write_temp(".json", r#"{"analytics": {"pagerank_iterations": 20}}"#);
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.analytics.pagerank_iterations, 20);
    }

    #[test]
    fn rejects_unknown_extension() {
        let file = write_temp(".toml", "worker_threshold = 1");
        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let file = write_temp(".yaml", "simulation:\n  alpha_decay: 1.5\n");
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "alpha_decay",
                ..
            }
        ));

        let config = EngineConfig {
            import_batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let file = write_temp(".json", "{ not json");
        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
