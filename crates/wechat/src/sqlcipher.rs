//! SQLCipher-backed gateway over rusqlite.
//!
//! Build with the `sqlcipher` feature to link SQLCipher; without it the key
//! pragmas are ignored by SQLite and only plaintext databases open.

use crate::error::DecryptionError;
use crate::gateway::{ColumnInfo, DatabaseHandle, DecryptionGateway, RowPage, RowRange};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::path::Path;
use tracing::debug;
use wxindex_core::constants::{DEFAULT_CIPHER_COMPATIBILITY, SQLITE_HEADER_SIZE};

/// Gateway opening WeChat databases with SQLCipher pragmas.
#[derive(Debug, Clone)]
pub struct SqlCipherGateway {
    cipher_compatibility: u32,
}

impl SqlCipherGateway {
    /// Gateway applying the given `cipher_compatibility` level.
    pub fn new(cipher_compatibility: u32) -> Self {
        Self {
            cipher_compatibility,
        }
    }

    fn try_open(&self, path: &Path, key_literal: &str) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(&format!(
            "PRAGMA key = {};\nPRAGMA cipher_compatibility = {};",
            key_literal, self.cipher_compatibility
        ))?;
        // The key is only checked once a page is read.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(conn)
    }
}

impl Default for SqlCipherGateway {
    fn default() -> Self {
        Self::new(DEFAULT_CIPHER_COMPATIBILITY)
    }
}

impl DecryptionGateway for SqlCipherGateway {
    fn open(&self, path: &Path, key: &str) -> Result<Box<dyn DatabaseHandle>, DecryptionError> {
        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DecryptionError::FileNotFound(path.display().to_string()),
            _ => DecryptionError::Io(format!("{}: {}", path.display(), e)),
        })?;
        if metadata.len() < SQLITE_HEADER_SIZE {
            return Err(DecryptionError::CorruptHeader(format!(
                "{} is {} bytes, shorter than a database header",
                path.display(),
                metadata.len()
            )));
        }

        let candidates = key_literals(key);
        let mut last_error = None;
        for (attempt, literal) in candidates.iter().enumerate() {
            match self.try_open(path, literal) {
                Ok(conn) => {
                    debug!(
                        "Opened {} with key format {}/{}",
                        path.display(),
                        attempt + 1,
                        candidates.len()
                    );
                    return Ok(Box::new(SqliteHandle { conn }));
                }
                Err(e) => {
                    debug!(
                        "Key format {}/{} failed for {}: {}",
                        attempt + 1,
                        candidates.len(),
                        path.display(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => open_error(path, e),
            None => DecryptionError::BadKey(format!("{}: no usable key format", path.display())),
        })
    }
}

/// Pragma values to try, most specific first.
fn key_literals(key: &str) -> Vec<String> {
    let key = key.trim();
    if let Some(hex_key) = key.strip_prefix("x'").and_then(|rest| rest.strip_suffix('\'')) {
        vec![
            format!("\"x'{}'\"", hex_key),
            format!("x'{}'", hex_key),
            format!("\"{}\"", hex_key),
        ]
    } else {
        let mut literals = vec![format!("\"{}\"", key)];
        if !key.is_empty() && key.len() % 2 == 0 && key.chars().all(|c| c.is_ascii_hexdigit()) {
            literals.push(format!("x'{}'", key));
        }
        literals
    }
}

fn open_error(path: &Path, err: rusqlite::Error) -> DecryptionError {
    let detail = format!("{}: {}", path.display(), err);
    match err.sqlite_error_code() {
        Some(ErrorCode::NotADatabase) => DecryptionError::BadKey(detail),
        Some(ErrorCode::DatabaseCorrupt) => DecryptionError::CorruptHeader(detail),
        Some(ErrorCode::CannotOpen) if !path.exists() => DecryptionError::FileNotFound(detail),
        _ => DecryptionError::Io(detail),
    }
}

fn read_error(err: rusqlite::Error) -> DecryptionError {
    DecryptionError::Io(err.to_string())
}

/// Quote an identifier for interpolation into SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

struct SqliteHandle {
    conn: Connection,
}

impl SqliteHandle {
    fn collect(&self, sql: &str) -> Result<RowPage, rusqlite::Error> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let column_count = columns.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(json_value(row.get_ref(i)?));
            }
            rows.push(values);
        }

        Ok(RowPage { columns, rows })
    }
}

impl DatabaseHandle for SqliteHandle {
    fn list_tables(&self) -> Result<Vec<String>, DecryptionError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .map_err(read_error)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(read_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_error)?;
        Ok(names)
    }

    fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>, DecryptionError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .map_err(read_error)?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get::<_, String>(1)?,
                    type_name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    nullable: row.get::<_, i32>(3)? == 0,
                    primary_key: row.get::<_, i32>(5)? > 0,
                })
            })
            .map_err(read_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_error)?;
        Ok(columns)
    }

    fn count_rows(&self, table: &str) -> Result<u64, DecryptionError> {
        let count: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
                [],
                |row| row.get(0),
            )
            .map_err(read_error)?;
        Ok(count.max(0) as u64)
    }

    fn read_rows(&self, table: &str, range: RowRange) -> Result<RowPage, DecryptionError> {
        let limit = range
            .limit
            .map(|l| l.min(i64::MAX as u64) as i64)
            .unwrap_or(-1);
        let sql = format!(
            "SELECT * FROM {} LIMIT {} OFFSET {}",
            quote_ident(table),
            limit,
            range.offset
        );
        self.collect(&sql).map_err(read_error)
    }

    fn query(&self, sql: &str) -> Result<RowPage, DecryptionError> {
        self.collect(sql).map_err(read_error)
    }
}

fn json_value(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(n) => serde_json::Value::Number(n.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Blob(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => serde_json::Value::String(text.to_string()),
            Err(_) => serde_json::Value::String(hex::encode(bytes)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_key_formats_in_order() {
        let literals = key_literals("x'abcd'");
        assert_eq!(literals, vec!["\"x'abcd'\"", "x'abcd'", "\"abcd\""]);
    }

    #[test]
    fn test_passphrase_key_is_quoted_only() {
        assert_eq!(key_literals("secret pass"), vec!["\"secret pass\""]);
        assert_eq!(key_literals("abcd"), vec!["\"abcd\"", "x'abcd'"]);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("Chat_1"), "\"Chat_1\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_blob_values_decode_or_hex() {
        assert_eq!(
            json_value(ValueRef::Blob(b"hello")),
            serde_json::Value::String("hello".to_string())
        );
        assert_eq!(
            json_value(ValueRef::Blob(&[0xff, 0x00])),
            serde_json::Value::String("ff00".to_string())
        );
    }
}
