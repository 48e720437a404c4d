use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ImgpkgError, Result};

/// Default number of images copied at the same time.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Environment variable pointing at a config file.
pub const CONFIG_ENV: &str = "IMGPKG_CONFIG";

/// imgpkg configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImgpkgConfig {
    /// Maximum number of concurrent copy / existence-check operations
    pub concurrency: usize,

    /// Registry client settings
    pub registry: RegistryConfig,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for ImgpkgConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            registry: RegistryConfig::default(),
            log_level: LogLevel::Warn,
        }
    }
}

impl ImgpkgConfig {
    /// Parse a YAML config document.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML config file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ImgpkgError::ConfigError(format!("Reading path {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&data)
    }

    /// Load from an explicit path, then `$IMGPKG_CONFIG`, then defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_path(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::from_path(&PathBuf::from(path)),
            _ => Ok(Self::default()),
        }
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ImgpkgError::ConfigError(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Talk plain HTTP to every registry
    pub plain_http: bool,

    /// Registries reached over plain HTTP (e.g., "localhost:5000")
    pub insecure_registries: Vec<String>,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
