//! Decryption gateway capability.
//!
//! The registry never implements a cipher. It asks a [`DecryptionGateway`] for a
//! [`DatabaseHandle`] and reads schema and rows through it.

use crate::error::DecryptionError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Column metadata as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared SQL type.
    pub type_name: String,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
}

/// Window of rows to read from a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowRange {
    /// Rows to skip.
    pub offset: u64,
    /// Maximum rows to return; `None` reads to the end.
    pub limit: Option<u64>,
}

impl RowRange {
    /// `limit` rows starting at `offset`.
    pub fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }
}

/// Rows returned by a delegated read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowPage {
    /// Column names, in select order.
    pub columns: Vec<String>,
    /// Row values, one inner vector per row.
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl RowPage {
    /// Number of rows in the page.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the page holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Live connection to one opened database.
///
/// Handles are owned by a single registry entry and are never used from two
/// threads at once; `Send` is enough.
pub trait DatabaseHandle: Send {
    /// Names of all user-visible tables.
    fn list_tables(&self) -> Result<Vec<String>, DecryptionError>;

    /// Column metadata for `table`. Empty if the table does not exist.
    fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>, DecryptionError>;

    /// Column names for `table`.
    fn columns(&self, table: &str) -> Result<Vec<String>, DecryptionError> {
        Ok(self
            .describe(table)?
            .into_iter()
            .map(|column| column.name)
            .collect())
    }

    /// Exact row count of `table`.
    fn count_rows(&self, table: &str) -> Result<u64, DecryptionError>;

    /// Read a window of rows from `table`.
    fn read_rows(&self, table: &str, range: RowRange) -> Result<RowPage, DecryptionError>;

    /// Run an ad-hoc read-only statement.
    fn query(&self, sql: &str) -> Result<RowPage, DecryptionError>;
}

/// Capability that turns a path and key into a [`DatabaseHandle`].
pub trait DecryptionGateway: Send + Sync {
    /// Open and decrypt the database at `path` with `key`.
    fn open(&self, path: &Path, key: &str) -> Result<Box<dyn DatabaseHandle>, DecryptionError>;
}
