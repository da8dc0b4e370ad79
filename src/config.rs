//! Top-level configuration.
//!
//! Settings come from a YAML file named by `MUXBUS_CONFIG` (optional),
//! then environment overrides per section.

use muxbus_broker::BrokerConfig;
use muxbus_transport::{MuxConfig, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "MUXBUS_CONFIG";

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Multiplexed stream transport.
    pub mux: MuxConfig,
    /// Broker transports and servers.
    pub broker: BrokerConfig,
    /// Reconnect monitor.
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Loads configuration from `MUXBUS_CONFIG` if set, then applies
    /// environment overrides and validates the result.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                let config = Self::from_file(&path)?;
                tracing::info!("loaded config from {}", path);
                config
            }
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.mux.apply_env_overrides();
        self.broker.apply_env_overrides();
        self.reconnect.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mux.workers == 0 || self.broker.workers == 0 {
            return Err(ConfigError::ValidationError(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.mux.queue_len == 0 || self.broker.queue_len == 0 {
            return Err(ConfigError::ValidationError(
                "queue_len must be at least 1".to_string(),
            ));
        }
        let max_frame = self.mux.max_frame_size;
        if max_frame != 0 && max_frame < muxbus_protocol::MIN_FRAME_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "max_frame_size must be at least {}",
                muxbus_protocol::MIN_FRAME_SIZE
            )));
        }
        if self.reconnect.initial_wait_ms > self.reconnect.max_wait_ms {
            return Err(ConfigError::ValidationError(format!(
                "reconnect initial_wait_ms ({}) exceeds max_wait_ms ({})",
                self.reconnect.initial_wait_ms, self.reconnect.max_wait_ms
            )));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(_, e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.mux.workers, 4);
        assert_eq!(config.reconnect.max_attempts, 60);
    }

    #[test]
    fn test_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "mux:\n  workers: 8\n  watermark_ms: 250\nreconnect:\n  max_attempts: 3\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.mux.workers, 8);
        assert_eq!(config.mux.watermark(), Duration::from_millis(250));
        assert_eq!(config.mux.queue_len, MuxConfig::default().queue_len);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.broker, BrokerConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muxbus.yaml");

        let mut config = Config::default();
        config.broker.workers = 2;
        config.reconnect.initial_wait_ms = 100;
        config.save(&path).unwrap();

        assert_eq!(Config::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/muxbus.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_, _)));
        assert!(err.to_string().contains("/nonexistent/muxbus.yaml"));
    }

    #[test]
    fn test_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mux: [not, a, map]").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::ParseError(_, _))
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.mux.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.broker.queue_len = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reconnect.initial_wait_ms = 5000;
        config.reconnect.max_wait_ms = 1000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}
