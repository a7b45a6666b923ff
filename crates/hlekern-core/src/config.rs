//! Kernel configuration (hlekern.toml)

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Hard upper bound on event queue capacity accepted by the guest ABI
pub const EVENT_QUEUE_CAPACITY_LIMIT: u32 = 127;

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Tunables for one emulated process' kernel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    /// Guest process ID, used to derive event port names
    pub process_id: u32,

    /// Maximum number of live kernel objects (None = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_objects: Option<usize>,

    /// Largest event queue capacity accepted at creation
    pub event_queue_max_capacity: u32,

    /// Recursion ceiling for recursive mutexes
    pub max_recursion: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            process_id: 1,
            max_objects: None,
            event_queue_max_capacity: EVENT_QUEUE_CAPACITY_LIMIT,
            max_recursion: u32::MAX,
        }
    }
}

impl KernelConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_queue_max_capacity == 0
            || self.event_queue_max_capacity > EVENT_QUEUE_CAPACITY_LIMIT
        {
            return Err(ConfigError::ValidationError(format!(
                "event_queue_max_capacity must be in 1..={}, got {}",
                EVENT_QUEUE_CAPACITY_LIMIT, self.event_queue_max_capacity
            )));
        }
        if self.max_recursion == 0 {
            return Err(ConfigError::ValidationError(
                "max_recursion must be at least 1".to_string(),
            ));
        }
        if self.max_objects == Some(0) {
            return Err(ConfigError::ValidationError(
                "max_objects must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
