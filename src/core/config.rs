// src/core/config.rs

use crate::constants::{
    DEFAULT_CONSOLE_HISTORY, DEFAULT_COOKIE_EXPIRY_DAYS, DEFAULT_COOKIE_PREFIX,
    DEFAULT_DISPATCH_DELAY_MS, DEFAULT_ERROR_QUEUE, DEFAULT_RETAINED_ERRORS,
    MAX_COOKIE_EXPIRY_DAYS,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read engine config '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse engine config '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid engine config '{path}': {reason}")]
    Invalid { path: String, reason: String },
    #[error("Failed to serialize engine config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Engine settings, loaded from `queueable.toml`. Every field has a default.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub dispatch: DispatchConfig,
    pub persistence: PersistenceConfig,
    pub console: ConsoleConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Delay before a ready command's plugin method is invoked.
    pub delay_ms: u64,
    /// Dispatch inline, skipping the delay. Used for deterministic runs.
    pub synchronous: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_DISPATCH_DELAY_MS,
            synchronous: false,
        }
    }
}

impl DispatchConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceConfig {
    pub prefix: String,
    pub expiry_days: u64,
    pub secure: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_COOKIE_PREFIX.to_string(),
            expiry_days: DEFAULT_COOKIE_EXPIRY_DAYS,
            secure: false,
        }
    }
}

impl PersistenceConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_days.saturating_mul(24 * 60 * 60))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConsoleConfig {
    pub history: usize,
    /// Errored chains kept in the table, oldest dropped first.
    pub retained_errors: usize,
    pub error_queue: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            history: DEFAULT_CONSOLE_HISTORY,
            retained_errors: DEFAULT_RETAINED_ERRORS,
            error_queue: DEFAULT_ERROR_QUEUE.to_string(),
        }
    }
}

impl EngineConfig {
    /// Configuration for tests and the CLI: dispatch happens inline.
    pub fn synchronous() -> Self {
        let mut config = Self::default();
        config.dispatch.synchronous = true;
        config
    }

    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        if config.persistence.expiry_days > MAX_COOKIE_EXPIRY_DAYS {
            return Err(ConfigError::Invalid {
                path: origin.to_string(),
                reason: format!(
                    "persistence.expiry_days is {} (maximum {})",
                    config.persistence.expiry_days, MAX_COOKIE_EXPIRY_DAYS
                ),
            });
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads the config at `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!(
                "Engine config '{}' not found, using defaults.",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [dispatch]
            synchronous = true

            [persistence]
            prefix = "APP_"
            "#,
            "inline",
        )
        .unwrap();

        assert!(config.dispatch.synchronous);
        assert_eq!(config.dispatch.delay_ms, DEFAULT_DISPATCH_DELAY_MS);
        assert_eq!(config.persistence.prefix, "APP_");
        assert_eq!(config.persistence.expiry_days, 7);
        assert_eq!(config.console.error_queue, "error");
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result = EngineConfig::from_toml_str("[dispatch]\nspeed = 3\n", "inline");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_oversized_expiry_is_rejected() {
        let result = EngineConfig::from_toml_str(
            "[persistence]\nexpiry_days = 1000000000\n",
            "inline",
        );
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));

        let persistence = PersistenceConfig {
            expiry_days: u64::MAX,
            ..Default::default()
        };
        assert_eq!(persistence.expiry(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::load(&dir.path().join("queueable.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_written_config_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queueable.toml");
        let mut config = EngineConfig::synchronous();
        config.console.history = 8;
        fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }
}
