//! Error types for CLI operations.

use thiserror::Error;
use wxindex_wechat::{ManifestError, RegistryError};

/// Main error type for CLI operations.
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] wxindex_core::Error),

    /// Keys file error.
    #[error("Keys file error: {0}")]
    Keys(String),

    /// Registry or query error.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// Invalid argument error.
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ManifestError> for CliError {
    fn from(err: ManifestError) -> Self {
        CliError::Registry(RegistryError::Manifest(err))
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Parse(err.to_string())
    }
}

/// Result alias for CLI operations.
pub type Result<T> = std::result::Result<T, CliError>;
