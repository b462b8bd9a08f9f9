use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Functional category assigned to a physical table.
///
/// The set is closed. `Unknown` is a terminal classification, not an error:
/// callers asking for a role a database lacks get an empty result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalRole {
    /// Chat history tables, usually sharded per conversation or time bucket.
    ChatMessages,

    /// Contact and group-member tables.
    ContactInfo,

    /// Conversation list / session summary tables.
    SessionIndex,

    /// Attachment and media index tables.
    MediaIndex,

    /// Anything the classifier could not place.
    Unknown,
}

impl LogicalRole {
    /// Every role, in map order.
    pub const ALL: [LogicalRole; 5] = [
        LogicalRole::ChatMessages,
        LogicalRole::ContactInfo,
        LogicalRole::SessionIndex,
        LogicalRole::MediaIndex,
        LogicalRole::Unknown,
    ];

    /// Stable short name used in CLI arguments and JSON output.
    pub fn as_str(self) -> &'static str {
        match self {
            LogicalRole::ChatMessages => "chat",
            LogicalRole::ContactInfo => "contact",
            LogicalRole::SessionIndex => "session",
            LogicalRole::MediaIndex => "media",
            LogicalRole::Unknown => "unknown",
        }
    }

    /// Role suggested by an externally declared database type label.
    ///
    /// WeChat keeps each database kind in a directory named after it
    /// (`Contact/`, `Message/`, `Session/`, `MediaDB/`, ...). The label is only a
    /// hint; table membership is always decided by classification.
    pub fn from_declared_type(label: &str) -> Option<LogicalRole> {
        let label = label.to_ascii_lowercase();
        if label.contains("contact") || label.contains("group") {
            Some(LogicalRole::ContactInfo)
        } else if label.contains("session") {
            Some(LogicalRole::SessionIndex)
        } else if ["media", "image", "video", "voice", "hardlink", "emoticon", "sticker", "file"]
            .iter()
            .any(|marker| label.contains(marker))
        {
            Some(LogicalRole::MediaIndex)
        } else if ["message", "msg", "chat"]
            .iter()
            .any(|marker| label.contains(marker))
        {
            Some(LogicalRole::ChatMessages)
        } else {
            None
        }
    }
}

impl fmt::Display for LogicalRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" | "chats" | "chat_messages" | "message" | "messages" => {
                Ok(LogicalRole::ChatMessages)
            }
            "contact" | "contacts" | "contact_info" => Ok(LogicalRole::ContactInfo),
            "session" | "sessions" | "session_index" => Ok(LogicalRole::SessionIndex),
            "media" | "media_index" | "attachment" | "attachments" => Ok(LogicalRole::MediaIndex),
            "unknown" => Ok(LogicalRole::Unknown),
            other => Err(crate::Error::parse(format!("unknown table role '{}'", other))),
        }
    }
}

/// Stable identifier of a database within one loaded manifest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatabaseId(String);

impl DatabaseId {
    /// Wrap an already-derived identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Shard suffix extracted from a physical table name.
///
/// Numeric shards (years, indices) compare numerically and sort before
/// textual shards (account hashes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShardKey {
    /// Time bucket or index suffix such as `2021` or `3`.
    Numeric(u64),

    /// Account or conversation hash suffix.
    Text(String),
}

impl Ord for ShardKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ShardKey::Numeric(a), ShardKey::Numeric(b)) => a.cmp(b),
            (ShardKey::Numeric(_), ShardKey::Text(_)) => Ordering::Less,
            (ShardKey::Text(_), ShardKey::Numeric(_)) => Ordering::Greater,
            (ShardKey::Text(a), ShardKey::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for ShardKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Numeric(n) => write!(f, "{}", n),
            ShardKey::Text(s) => f.write_str(s),
        }
    }
}

/// Registry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryState {
    /// Nothing loaded yet.
    Uninitialized,

    /// A load is in progress.
    Initializing,

    /// A complete generation is live.
    Ready,

    /// A reload was requested; the live generation is about to be replaced.
    Stale,
}

impl fmt::Display for RegistryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistryState::Uninitialized => "uninitialized",
            RegistryState::Initializing => "initializing",
            RegistryState::Ready => "ready",
            RegistryState::Stale => "stale",
        };
        f.write_str(name)
    }
}
