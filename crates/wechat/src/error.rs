//! Error types for the WeChat database registry.

use thiserror::Error;
use wxindex_core::DatabaseId;

/// Malformed manifest input. Fatal for the load that received it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// An entry had a blank path.
    #[error("Manifest entry {index} has an empty path")]
    EmptyPath {
        /// Zero-based position in the manifest.
        index: usize,
    },

    /// An entry had blank key material.
    #[error("Manifest entry {index} ({path}) has an empty key")]
    EmptyKey {
        /// Zero-based position in the manifest.
        index: usize,
        /// Path of the offending entry.
        path: String,
    },

    /// Key material that cannot be passed to the cipher safely.
    #[error("Manifest entry {index} ({path}) has malformed key material: {reason}")]
    MalformedKey {
        /// Zero-based position in the manifest.
        index: usize,
        /// Path of the offending entry.
        path: String,
        /// What was wrong with the key.
        reason: String,
    },

    /// Two descriptors handed to one load share a database id.
    #[error("Database {id} appears more than once ({path})")]
    DuplicateDatabase {
        /// The repeated id.
        id: DatabaseId,
        /// Path of the second occurrence.
        path: String,
    },
}

/// Per-database open failure. Never aborts a registry load.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DecryptionError {
    /// The key did not decrypt the database.
    #[error("Bad key: {0}")]
    BadKey(String),

    /// The database file does not exist.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// The file is too short or its header is damaged.
    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    /// Any other I/O or engine failure while opening or reading the schema.
    #[error("I/O failure: {0}")]
    Io(String),
}

/// Main error type for registry and query operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Manifest rejected before loading.
    #[error("Invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    /// Database id not present in the current generation.
    #[error("Database not found: {0}")]
    NotFound(DatabaseId),

    /// Table not present in the given database.
    #[error("Table '{table}' not found in database {database}")]
    TableNotFound {
        /// Database that was searched.
        database: DatabaseId,
        /// Requested table name.
        table: String,
    },

    /// The database exists but could not be opened.
    #[error("Database {database} is not accessible: {reason}")]
    Inaccessible {
        /// Database that failed to open.
        database: DatabaseId,
        /// Why it failed.
        reason: DecryptionError,
    },

    /// The generation a caller pinned has been replaced.
    #[error("Registry generation {pinned} was superseded by generation {current}")]
    Stale {
        /// Generation the caller was working against.
        pinned: u64,
        /// Generation that replaced it.
        current: u64,
    },

    /// Open or schema failure surfaced to a direct caller.
    #[error("Decryption failed: {0}")]
    Decryption(#[from] DecryptionError),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File monitoring error
    #[error("File monitoring error: {0}")]
    FileMonitor(#[from] notify::Error),

    /// Other errors wrapped in anyhow
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
