//! Chat message normalization.
//!
//! WeChat message tables vary in column naming across versions and shards.
//! Each well-known field is resolved by an ordered list of candidate
//! substrings; the first candidate matching any column wins. Columns not
//! claimed by a known field are kept in `extra`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use wxindex_core::DatabaseId;

const SENDER_CANDIDATES: &[&str] = &["meslocalid", "messvrid", "localid"];
const TIME_CANDIDATES: &[&str] = &["msgcreatetime", "createtime", "timestamp", "time"];
const CONTENT_CANDIDATES: &[&str] = &["msgcontent", "content", "message", "msg"];
const MESSAGE_ID_CANDIDATES: &[&str] = &["meslocalid", "messvrid", "msgid", "id", "localid"];
const TYPE_CANDIDATES: &[&str] = &["messagetype", "msgtype", "type"];

/// Millisecond timestamps are above this.
const MILLIS_THRESHOLD: f64 = 1e12;
/// Second timestamps are above this; smaller values are not dates.
const SECONDS_THRESHOLD: f64 = 1e9;

/// One normalized chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    /// Source database.
    pub database_id: DatabaseId,
    /// Declared type of the source database.
    pub database_type: String,
    /// Source table.
    pub table: String,
    /// Sender identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<serde_json::Value>,
    /// Message time, when the time column parses as a date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Raw value of the time column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_raw: Option<serde_json::Value>,
    /// Message body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    /// Message identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<serde_json::Value>,
    /// Message type code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<serde_json::Value>,
    /// Remaining columns by name.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Column positions of the known fields in one table layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatColumns {
    sender: Option<usize>,
    time: Option<usize>,
    content: Option<usize>,
    message_id: Option<usize>,
    message_type: Option<usize>,
}

impl ChatColumns {
    /// Resolve known fields against `columns`.
    pub fn resolve(columns: &[String]) -> Self {
        Self {
            sender: find_column(columns, SENDER_CANDIDATES),
            time: find_column(columns, TIME_CANDIDATES),
            content: find_column(columns, CONTENT_CANDIDATES),
            message_id: find_column(columns, MESSAGE_ID_CANDIDATES),
            message_type: find_column(columns, TYPE_CANDIDATES),
        }
    }

    /// Build a record from one row of a table with this layout.
    pub fn normalize(
        &self,
        database_id: &DatabaseId,
        database_type: &str,
        table: &str,
        columns: &[String],
        row: &[serde_json::Value],
    ) -> ChatRecord {
        let mut record = ChatRecord {
            database_id: database_id.clone(),
            database_type: database_type.to_string(),
            table: table.to_string(),
            sender: None,
            timestamp: None,
            timestamp_raw: None,
            content: None,
            message_id: None,
            message_type: None,
            extra: BTreeMap::new(),
        };

        for (index, name) in columns.iter().enumerate() {
            let value = row.get(index).cloned().unwrap_or(serde_json::Value::Null);
            // A column claimed by several fields goes to the first in this order.
            if Some(index) == self.time {
                // Blank values stay in `timestamp_raw` with no parsed time.
                record.timestamp = parse_timestamp(&value);
                record.timestamp_raw = Some(value);
            } else if Some(index) == self.sender {
                record.sender = Some(value);
            } else if Some(index) == self.content {
                record.content = Some(value);
            } else if Some(index) == self.message_id {
                record.message_id = Some(value);
            } else if Some(index) == self.message_type {
                record.message_type = Some(value);
            } else if !name.eq_ignore_ascii_case("rowid") {
                record.extra.insert(name.clone(), value);
            }
        }

        record
    }
}

fn find_column(columns: &[String], candidates: &[&str]) -> Option<usize> {
    candidates.iter().find_map(|candidate| {
        columns
            .iter()
            .position(|column| column.to_lowercase().contains(candidate))
    })
}

/// Interpret a time column value as seconds, milliseconds or an ISO string.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => {
            let raw = n.as_f64()?;
            if raw > MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(raw as i64).single()
            } else if raw > SECONDS_THRESHOLD {
                Utc.timestamp_opt(raw as i64, 0).single()
            } else {
                None
            }
        }
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        _ => None,
    }
}
