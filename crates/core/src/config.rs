use crate::constants::{
    DEFAULT_CIPHER_COMPATIBILITY, DEFAULT_EXPORT_PATH, DEFAULT_MAX_CONCURRENT_OPENS,
    DEFAULT_READ_BATCH_SIZE,
};
use crate::Error;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for wxindex.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WxIndexConfig {
    /// Registry load and read behaviour.
    pub registry: RegistryConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Chat export configuration.
    pub export: ExportConfig,
}

/// Registry load configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Upper bound on databases opened at the same time.
    pub max_concurrent_opens: usize,

    /// SQLCipher `cipher_compatibility` level applied on open.
    pub cipher_compatibility: u32,

    /// Probe column names for tables the name patterns cannot place.
    pub probe_columns: bool,

    /// Count rows of every classified table while loading.
    pub count_rows_on_load: bool,

    /// Rows fetched per delegated read.
    pub read_batch_size: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: LogLevel,

    /// Include the event target in log lines.
    pub with_target: bool,
}

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level.
    Error,

    /// Warning level.
    Warn,

    /// Info level.
    Info,

    /// Debug level.
    Debug,

    /// Trace level.
    Trace,
}

impl LogLevel {
    /// Lowercase directive understood by `tracing` filters.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Chat export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Default output path for `export`.
    pub output_path: PathBuf,
}

impl WxIndexConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?;
        Ok(config_dir.join("wxindex").join("config.toml"))
    }

    /// Load configuration from file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::FileSystem(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Parse(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Parse(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
            .map_err(|e| Error::FileSystem(format!("Failed to write config file: {}", e)))
    }

    /// Reject values the registry cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.registry.max_concurrent_opens == 0 {
            return Err(Error::validation(
                "registry.max_concurrent_opens must be at least 1",
            ));
        }
        if self.registry.read_batch_size == 0 {
            return Err(Error::validation(
                "registry.read_batch_size must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_opens: DEFAULT_MAX_CONCURRENT_OPENS,
            cipher_compatibility: DEFAULT_CIPHER_COMPATIBILITY,
            probe_columns: true,
            count_rows_on_load: false,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            with_target: false,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from(DEFAULT_EXPORT_PATH),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[registry]\nmax_concurrent_opens = 8\n").expect("write");

        let config = WxIndexConfig::load(&path).expect("load");
        assert_eq!(config.registry.max_concurrent_opens, 8);
        assert_eq!(config.registry.cipher_compatibility, 3);
        assert_eq!(config.logging.level, LogLevel::Warn);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[registry]\nread_batch_size = 0\n").expect("write");

        assert!(matches!(
            WxIndexConfig::load(&path),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let mut config = WxIndexConfig::default();
        config.logging.level = LogLevel::Debug;
        config.save(&path).expect("save");

        let loaded = WxIndexConfig::load(&path).expect("load");
        assert_eq!(loaded.logging.level, LogLevel::Debug);
    }
}
