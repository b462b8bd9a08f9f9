//! `.keys` file parsing.
//!
//! The file is a log of key extraction output. A database is listed by a
//! `sqlcipher db path: '<path>'` line followed later by a
//! `PRAGMA key = "<key>"` line; anything else is ignored.

use crate::error::{CliError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tracing::{debug, info};
use wxindex_wechat::ManifestEntry;

static PATH_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^sqlcipher db path: '([^']+)'").expect("valid path regex")
});
static KEY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^PRAGMA key = "([^"]+)""#).expect("valid key regex"));

/// Parse `.keys` content into manifest entries, in file order.
pub fn parse_keys(content: &str) -> Vec<ManifestEntry> {
    let mut entries = Vec::new();
    let mut current_path: Option<String> = None;

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(caps) = PATH_LINE.captures(line) {
            current_path = Some(caps[1].to_string());
            continue;
        }
        if let Some(caps) = KEY_LINE.captures(line) {
            // A key without a preceding path belongs to nothing.
            if let Some(path) = current_path.take() {
                entries.push(ManifestEntry::new(path, &caps[1]));
            }
        }
    }

    entries
}

/// Read and parse a `.keys` file.
pub fn load_keys_file(path: &Path) -> Result<Vec<ManifestEntry>> {
    if !path.exists() {
        return Err(CliError::Keys(format!(
            "keys file not found: {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    let entries = parse_keys(&content);
    info!("Loaded {} keys from {}", entries.len(), path.display());
    for entry in &entries {
        debug!("Key entry for {}", entry.path);
    }
    Ok(entries)
}
