//! Settings management

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Worker threads of the background executor.
    pub background_threads: usize,
    /// Base name of each runtime's JS thread.
    pub js_thread_name: String,
    /// Global object scripts reach modules through.
    pub namespace: String,
    /// `tracing` filter used when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            background_threads: 2,
            js_thread_name: "tether-js".to_string(),
            namespace: "tether".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value '{value}' for {variable}")]
    Environment { variable: String, value: String },
}

impl BridgeSettings {
    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON settings file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Apply `TETHER_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, SettingsError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("TETHER_BACKGROUND_THREADS") {
            self.background_threads = value
                .trim()
                .parse()
                .ok()
                .filter(|threads| *threads > 0)
                .ok_or(SettingsError::Environment {
                    variable: "TETHER_BACKGROUND_THREADS".to_string(),
                    value,
                })?;
        }
        if let Some(value) = lookup("TETHER_NAMESPACE") {
            self.namespace = value;
        }
        if let Some(value) = lookup("TETHER_LOG") {
            self.log_filter = value;
        }
        Ok(self)
    }
}
