//! Manifest validation and database descriptors.
//!
//! The keys manifest itself is parsed by an outer adapter; this module takes
//! its entries, rejects malformed ones, and derives the immutable
//! [`DatabaseDescriptor`] the registry loads.

use crate::error::ManifestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use wxindex_core::constants::{DATABASE_ID_BYTES, UNKNOWN_DECLARED_TYPE};
use wxindex_core::DatabaseId;

/// One raw manifest line pair: a database path and the key that opens it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path to the encrypted database file.
    pub path: String,
    /// Opaque key material, usually `x'<hex>'`.
    pub key: String,
    /// Externally declared database type, if the manifest carried one.
    pub declared_type: Option<String>,
}

impl ManifestEntry {
    /// Entry without a declared type; the type is derived from the path.
    pub fn new(path: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            declared_type: None,
        }
    }
}

/// Immutable description of one database in a loaded manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    /// Stable id derived from the path.
    pub id: DatabaseId,
    /// Path to the encrypted file.
    pub path: PathBuf,
    /// Key material handed to the decryption gateway.
    pub key: String,
    /// Declared type label, passed through for display.
    pub declared_type: String,
    /// File name component of the path.
    pub filename: String,
    /// File size in bytes when the descriptor was created.
    pub size: Option<u64>,
    /// Last modification time when the descriptor was created.
    pub last_modified: Option<DateTime<Utc>>,
    /// Whether the file existed when the descriptor was created.
    pub accessible: bool,
}

impl DatabaseDescriptor {
    /// Build a descriptor, reading file metadata from disk.
    pub fn from_entry(entry: &ManifestEntry) -> Self {
        let path = entry.path.trim();
        let path_buf = PathBuf::from(path);
        let filename = path_buf
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("unknown")
            .to_string();

        let declared_type = entry
            .declared_type
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| declared_type_from_path(path));

        let metadata = std::fs::metadata(&path_buf).ok();
        let size = metadata.as_ref().map(|m| m.len());
        let last_modified = metadata
            .as_ref()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        Self {
            id: database_id_for_path(path),
            path: path_buf,
            key: entry.key.trim().to_string(),
            declared_type,
            filename,
            size,
            last_modified,
            accessible: metadata.map(|m| m.is_file()).unwrap_or(false),
        }
    }
}

/// Validate manifest entries and derive descriptors.
///
/// Entries repeating an earlier path are dropped so ids stay unique. Order of
/// first appearance is preserved.
pub fn descriptors_from_manifest(
    entries: &[ManifestEntry],
) -> Result<Vec<DatabaseDescriptor>, ManifestError> {
    let mut seen_paths = HashSet::new();
    let mut descriptors = Vec::with_capacity(entries.len());

    for (index, entry) in entries.iter().enumerate() {
        let path = entry.path.trim();
        if path.is_empty() {
            return Err(ManifestError::EmptyPath { index });
        }
        validate_key(&entry.key).map_err(|reason| match reason {
            KeyProblem::Empty => ManifestError::EmptyKey {
                index,
                path: path.to_string(),
            },
            KeyProblem::Malformed(reason) => ManifestError::MalformedKey {
                index,
                path: path.to_string(),
                reason,
            },
        })?;

        if !seen_paths.insert(path.to_string()) {
            tracing::debug!("Skipping duplicate manifest entry for {}", path);
            continue;
        }
        descriptors.push(DatabaseDescriptor::from_entry(entry));
    }

    Ok(descriptors)
}

/// Derive the stable database id for a path.
pub fn database_id_for_path(path: &str) -> DatabaseId {
    let digest = Sha256::digest(path.trim().as_bytes());
    DatabaseId::new(hex::encode(&digest[..DATABASE_ID_BYTES]))
}

/// Declared type implied by the directory holding a `.db` file.
///
/// `.../Contact/wccontact_new2.db` yields `Contact`.
pub fn declared_type_from_path(path: &str) -> String {
    let path = Path::new(path);
    let is_db = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("db"))
        .unwrap_or(false);
    if !is_db {
        return UNKNOWN_DECLARED_TYPE.to_string();
    }

    path.parent()
        .and_then(|parent| parent.file_name())
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_DECLARED_TYPE.to_string())
}

enum KeyProblem {
    Empty,
    Malformed(String),
}

fn validate_key(raw: &str) -> Result<(), KeyProblem> {
    let key = raw.trim();
    if key.is_empty() {
        return Err(KeyProblem::Empty);
    }

    if let Some(inner) = key.strip_prefix("x'").and_then(|rest| rest.strip_suffix('\'')) {
        if inner.is_empty() {
            return Err(KeyProblem::Empty);
        }
        hex::decode(inner)
            .map_err(|e| KeyProblem::Malformed(format!("hex key decode failed: {}", e)))?;
        return Ok(());
    }

    if key.contains('"') || key.chars().any(char::is_control) {
        return Err(KeyProblem::Malformed(
            "key contains quote or control characters".to_string(),
        ));
    }
    Ok(())
}
