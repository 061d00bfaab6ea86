//! Configuration module for frameflow-rs
//!
//! This module handles configuration for the frame-processing pool:
//! - Worker configuration (framing, checksum, operation mode)
//! - Pool settings (sizing, retries, sandbox limits)
//! - Processor config files (`frameflow.toml`) bundling both with a parser script
//!
//! # Config Location
//!
//! The default config file lives in the platform config directory under
//! `dev.frameflow.frameflow-rs`:
//! - **Linux**: `~/.config/dev.frameflow.frameflow-rs/frameflow.toml`
//! - **macOS**: `~/Library/Application Support/dev.frameflow.frameflow-rs/frameflow.toml`
//! - **Windows**: `%APPDATA%\dev.frameflow.frameflow-rs\frameflow.toml`
//!
//! # Example
//!
//! ```ignore
//! use frameflow_rs::config::ProcessorConfig;
//!
//! let config = ProcessorConfig::load("frameflow.toml")?;
//! config.worker.validate()?;
//! config.save("frameflow.toml")?;
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{ProcessorError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "dev.frameflow.frameflow-rs";

/// Config filename
pub const CONFIG_FILE: &str = "frameflow.toml";

/// Get the application config directory path
pub fn app_config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path to the default config file
pub fn default_config_path() -> Option<PathBuf> {
    app_config_dir().map(|p| p.join(CONFIG_FILE))
}

/// A complete processor configuration as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Config format version
    #[serde(default = "default_config_version")]
    pub version: u32,

    /// Inline parser script for project mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser_script: Option<String>,

    /// Parser script file, resolved relative to the config file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser_script_path: Option<PathBuf>,

    /// Framing and mapping configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Pool limits
    #[serde(default)]
    pub pool: PoolSettings,
}

fn default_config_version() -> u32 {
    1
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            version: default_config_version(),
            parser_script: None,
            parser_script_path: None,
            worker: WorkerConfig::default(),
            pool: PoolSettings::default(),
        }
    }
}

impl ProcessorConfig {
    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProcessorError::Configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let mut config: ProcessorConfig = toml::from_str(&content).map_err(|e| {
            ProcessorError::Configuration(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        if let (Some(script_path), Some(parent)) = (&config.parser_script_path, path.parent()) {
            if script_path.is_relative() {
                config.parser_script_path = Some(parent.join(script_path));
            }
        }

        Ok(config)
    }

    /// Load the config file, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Save the config file to disk as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(ProcessorError::from)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            ProcessorError::Serialization(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content)
            .map_err(ProcessorError::from)
            .with_context(|| format!("Failed to write config file {:?}", path))
    }

    /// Resolve the parser script source, preferring the inline script
    pub fn parser_source(&self) -> Result<Option<String>> {
        if let Some(script) = &self.parser_script {
            return Ok(Some(script.clone()));
        }
        match &self.parser_script_path {
            Some(path) => std::fs::read_to_string(path).map(Some).map_err(|e| {
                ProcessorError::Configuration(format!(
                    "Failed to read parser script {:?}: {}",
                    path, e
                ))
            }),
            None => Ok(None),
        }
    }

    /// Validate worker and pool sections together
    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        self.pool.validate()
    }
}
