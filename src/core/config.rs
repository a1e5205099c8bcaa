/*!
 * Runtime Configuration
 * Environment-derived settings, read once at process start
 */

use super::limits::DEFAULT_THREAD_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Environment variable names
pub mod env {
    pub const THREAD_CAPACITY: &str = "PERSONALITY_THREAD_CAPACITY";
    pub const LARGE_ADDRESS_AWARE: &str = "PERSONALITY_LARGE_ADDRESS_AWARE";
    pub const XSTATE_COMPACTION: &str = "PERSONALITY_XSTATE_COMPACTION";
    pub const DLL_OVERRIDES: &str = "PERSONALITY_DLL_OVERRIDES";
    pub const APP_NAME: &str = "PERSONALITY_APP_NAME";
    pub const TRACE_JSON: &str = "PERSONALITY_TRACE_JSON";
}

/// Process-wide runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Number of TEB slots (and therefore guest threads) available
    pub thread_capacity: usize,
    /// Enable large-address-space mode at startup
    pub large_address_aware: bool,
    /// Whether the host uses the compacted extended-state format
    pub xstate_compaction: bool,
    /// Load-order override string (`mod1,mod2=n,b;mod3=b`)
    pub dll_overrides: Option<String>,
    /// Application identity used for per-application load order
    pub app_name: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_capacity: DEFAULT_THREAD_CAPACITY,
            large_address_aware: false,
            xstate_compaction: false,
            dll_overrides: None,
            app_name: None,
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(env::THREAD_CAPACITY) {
            config.thread_capacity = value
                .trim()
                .parse()
                .ok()
                .filter(|n: &usize| *n > 0)
                .ok_or(ConfigError::InvalidValue {
                    key: env::THREAD_CAPACITY,
                    value,
                })?;
        }
        if let Some(value) = lookup(env::LARGE_ADDRESS_AWARE) {
            config.large_address_aware = parse_flag(env::LARGE_ADDRESS_AWARE, value)?;
        }
        if let Some(value) = lookup(env::XSTATE_COMPACTION) {
            config.xstate_compaction = parse_flag(env::XSTATE_COMPACTION, value)?;
        }
        config.dll_overrides = lookup(env::DLL_OVERRIDES).filter(|s| !s.is_empty());
        config.app_name = lookup(env::APP_NAME).filter(|s| !s.is_empty());

        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    #[must_use]
    pub fn with_thread_capacity(mut self, capacity: usize) -> Self {
        self.thread_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_large_address_aware(mut self, enabled: bool) -> Self {
        self.large_address_aware = enabled;
        self
    }

    #[must_use]
    pub fn with_xstate_compaction(mut self, enabled: bool) -> Self {
        self.xstate_compaction = enabled;
        self
    }

    #[must_use]
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_dll_overrides(mut self, overrides: impl Into<String>) -> Self {
        self.dll_overrides = Some(overrides.into());
        self
    }
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key, value }),
    }
}
