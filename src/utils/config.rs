//! Configuration management for the OTR overlay.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::engine::Policy;
use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "otr-overlay.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "OTR_OVERLAY";

/// Complete configuration for the overlay
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OverlayConfig {
    /// Durable storage configuration
    pub storage: StorageConfig,
    /// Protocol behaviour
    pub otr: OtrConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Private key generation
    pub keygen: KeygenConfig,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory; every account gets a subdirectory holding its private
    /// key, fingerprint and instance tag files
    pub data_dir: PathBuf,
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtrConfig {
    /// Initial global policy
    pub policy: Policy,
    /// Seconds of outbound silence after which a heartbeat is sent
    pub heartbeat_interval: u64,
    /// Seconds after which an unfinished key exchange is discarded
    pub ake_timeout: u64,
    /// Housekeeping poll interval in seconds while a conversation is private
    pub poll_interval: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Include timestamps in log lines
    pub timestamps: bool,
}

/// Key generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenConfig {
    /// Generate a private key on `initialize` when the account has none
    pub auto_generate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("otr-overlay");

        Self { data_dir }
    }
}

impl Default for OtrConfig {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            heartbeat_interval: crate::defaults::DEFAULT_HEARTBEAT_INTERVAL,
            ake_timeout: crate::defaults::DEFAULT_AKE_TIMEOUT,
            poll_interval: crate::defaults::DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            timestamps: true,
        }
    }
}

impl Default for KeygenConfig {
    fn default() -> Self {
        Self {
            auto_generate: true,
        }
    }
}

impl OverlayConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("otr-overlay")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    config = Self::from_file(location)?;
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(policy) = std::env::var(format!("{ENV_PREFIX}_POLICY")) {
            self.otr.policy = policy.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_POLICY"),
                value: policy,
            })?;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var(format!("{ENV_PREFIX}_STORAGE_DATA_DIR")) {
            self.storage.data_dir = PathBuf::from(data_dir);
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.otr.heartbeat_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "otr.heartbeat_interval".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        if self.otr.ake_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "otr.ake_timeout".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        if self.otr.poll_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "otr.poll_interval".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "logging.level".to_string(),
                    value: self.logging.level.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Ensure the storage directory exists
    pub fn ensure_directories(&self) -> Result<()> {
        let dir = &self.storage.data_dir;
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                path: dir.display().to_string(),
            })?;
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = OverlayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.otr.policy, Policy::Opportunistic);
        assert!(config.keygen.auto_generate);
        assert!(config.storage.data_dir.ends_with("otr-overlay"));
    }

    #[test]
    fn test_config_serialization() {
        let config = OverlayConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("heartbeat_interval"));
        assert!(toml_str.contains("policy = \"opportunistic\""));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = OverlayConfig::default();
        config.otr.policy = Policy::Always;
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = OverlayConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.otr.policy, Policy::Always);
        assert_eq!(loaded.otr.ake_timeout, config.otr.ake_timeout);
    }

    #[test]
    fn test_config_validation() {
        let mut config = OverlayConfig::default();
        config.otr.heartbeat_interval = 0;
        assert!(config.validate().is_err());

        config = OverlayConfig::default();
        config.otr.poll_interval = 0;
        assert!(config.validate().is_err());

        config = OverlayConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("OTR_OVERLAY_POLICY", "never");

        let config = OverlayConfig::default().merge_from_env().unwrap();
        assert_eq!(config.otr.policy, Policy::Never);

        std::env::set_var("OTR_OVERLAY_POLICY", "sometimes");
        assert!(OverlayConfig::default().merge_from_env().is_err());

        std::env::remove_var("OTR_OVERLAY_POLICY");
    }
}
