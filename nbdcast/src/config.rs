//! Configuration for nbdcast.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::DEFAULT_EXPORT_SIZE_BYTES;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Settings applied to every export created from this config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Size of the backing store in bytes, fixed at creation.
    pub size_bytes: u64,

    /// Directory for backing files. Uses the system temp dir if unset.
    pub dir: Option<PathBuf>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            size_bytes: DEFAULT_EXPORT_SIZE_BYTES,
            dir: None,
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "export.size_bytes",
                reason: "must be > 0",
            });
        }
        Ok(())
    }

    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Stream relay settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long a publish may wait for the consumer to take an event.
    /// Unset means wait forever.
    pub send_timeout_ms: Option<u64>,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "relay.send_timeout_ms",
                reason: "must be > 0 when set",
            });
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.export.validate()?;
        self.relay.validate()
    }
}
