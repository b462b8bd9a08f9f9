//! Schema classification.
//!
//! WeChat shards logically identical tables per account hash or time bucket
//! (`Chat_1d35a41b…`, `chat_msg_2021`, `MSG0`) and names them inconsistently
//! across versions. The classifier assigns every physical table a
//! [`LogicalRole`] in three steps:
//!
//! 1. name markers, matched against the table's tokens once the shard suffix
//!    is stripped;
//! 2. for ambiguous or unmatched names, a column probe against a minimal
//!    required-column set per role;
//! 3. otherwise [`LogicalRole::Unknown`].
//!
//! A name match always beats a probe result. Classification never fails: a
//! probe error counts as "no columns".

use crate::error::DecryptionError;
use crate::gateway::DatabaseHandle;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;
use wxindex_core::{DatabaseId, LogicalRole, ShardKey};

/// Source of column names for a table.
pub trait ColumnProbe {
    /// Column names of `table`.
    fn probe_columns(&self, table: &str) -> Result<Vec<String>, DecryptionError>;
}

impl<H: DatabaseHandle + ?Sized> ColumnProbe for H {
    fn probe_columns(&self, table: &str) -> Result<Vec<String>, DecryptionError> {
        self.columns(table)
    }
}

/// Probe that knows no columns; classification falls back to names only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl ColumnProbe for NoProbe {
    fn probe_columns(&self, _table: &str) -> Result<Vec<String>, DecryptionError> {
        Ok(Vec::new())
    }
}

/// What decided a table's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationBasis {
    /// Name markers.
    Name,
    /// Column probe.
    Columns,
    /// SQLite bookkeeping or full-text-search shadow table.
    Internal,
    /// Nothing matched.
    Fallback,
}

/// Role and shard assigned to one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedTable {
    /// Physical table name.
    pub name: String,
    /// Assigned role.
    pub role: LogicalRole,
    /// Shard suffix, if the name carried one.
    pub shard_key: Option<ShardKey>,
    /// What decided the role.
    pub basis: ClassificationBasis,
}

/// Classification of every table in one database, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// One entry per distinct table name.
    pub tables: Vec<ClassifiedTable>,
}

impl Classification {
    /// Role assigned to `table`, if it was classified.
    pub fn role_of(&self, table: &str) -> Option<LogicalRole> {
        self.tables
            .iter()
            .find(|entry| entry.name == table)
            .map(|entry| entry.role)
    }

    /// Every table classified as [`LogicalRole::Unknown`].
    pub fn all_unknown(names: &[String]) -> Self {
        let mut seen = HashSet::new();
        let tables = names
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .map(|name| ClassifiedTable {
                name: name.clone(),
                role: LogicalRole::Unknown,
                shard_key: split_shard(name).1,
                basis: ClassificationBasis::Fallback,
            })
            .collect();
        Self { tables }
    }
}

/// Roles in tie-break order.
const PRECEDENCE: [LogicalRole; 4] = [
    LogicalRole::SessionIndex,
    LogicalRole::MediaIndex,
    LogicalRole::ContactInfo,
    LogicalRole::ChatMessages,
];

fn name_markers(role: LogicalRole) -> &'static [&'static str] {
    match role {
        LogicalRole::SessionIndex => &["session", "sessions", "conversation", "conversations"],
        LogicalRole::MediaIndex => &[
            "media",
            "image",
            "images",
            "img",
            "video",
            "voice",
            "file",
            "files",
            "attach",
            "attachment",
            "attachments",
            "hardlink",
            "emoticon",
            "emoji",
            "sticker",
        ],
        LogicalRole::ContactInfo => &[
            "contact",
            "contacts",
            "friend",
            "friends",
            "member",
            "members",
            "wccontact",
            "groupcontact",
        ],
        LogicalRole::ChatMessages => &["chat", "chats", "chatroom", "msg", "message", "messages"],
        LogicalRole::Unknown => &[],
    }
}

/// Column groups a table must cover to qualify for a role. Each group is
/// satisfied by any column containing any of its needles.
fn required_columns(role: LogicalRole) -> &'static [&'static [&'static str]] {
    match role {
        LogicalRole::ChatMessages => &[
            &["sender", "talker", "from", "des", "localid", "svrid", "msgid"],
            &["time"],
            &["content", "body", "text", "message"],
        ],
        LogicalRole::ContactInfo => &[
            &["username", "usrname", "user_name", "wxid"],
            &["nick", "remark", "alias", "displayname", "display_name"],
        ],
        LogicalRole::SessionIndex => &[
            &["username", "usrname", "talker", "session"],
            &["time"],
            &["unread", "lastmsg", "last_msg", "digest", "summary"],
        ],
        LogicalRole::MediaIndex => &[
            &["path", "file", "url", "md5"],
            &["size", "length", "len", "width", "duration"],
        ],
        LogicalRole::Unknown => &[],
    }
}

/// Classify every table of one database.
pub fn classify<P: ColumnProbe + ?Sized>(
    database_id: &DatabaseId,
    table_names: &[String],
    probe: &P,
) -> Classification {
    let mut seen = HashSet::new();
    let mut tables = Vec::with_capacity(table_names.len());

    for name in table_names {
        if !seen.insert(name.as_str()) {
            continue;
        }
        let classified = classify_table(name, probe);
        debug!(
            "db {} table {} -> {} ({:?})",
            database_id, name, classified.role, classified.basis
        );
        tables.push(classified);
    }

    Classification { tables }
}

fn classify_table<P: ColumnProbe + ?Sized>(name: &str, probe: &P) -> ClassifiedTable {
    let (base, shard_key) = split_shard(name);
    let words = name_words(base);

    let resolved = if is_internal(name, &words) {
        (LogicalRole::Unknown, ClassificationBasis::Internal)
    } else {
        let candidates: Vec<LogicalRole> = PRECEDENCE
            .iter()
            .copied()
            .filter(|role| {
                name_markers(*role)
                    .iter()
                    .any(|marker| words.iter().any(|word| word == marker))
            })
            .collect();

        match candidates.as_slice() {
            [only] => (*only, ClassificationBasis::Name),
            [] => match probe_role(name, probe, &PRECEDENCE) {
                Some(role) => (role, ClassificationBasis::Columns),
                None => (LogicalRole::Unknown, ClassificationBasis::Fallback),
            },
            [first, ..] => match probe_role(name, probe, &candidates) {
                Some(role) => (role, ClassificationBasis::Columns),
                None => (*first, ClassificationBasis::Name),
            },
        }
    };

    ClassifiedTable {
        name: name.to_string(),
        role: resolved.0,
        shard_key,
        basis: resolved.1,
    }
}

fn probe_role<P: ColumnProbe + ?Sized>(
    name: &str,
    probe: &P,
    roles: &[LogicalRole],
) -> Option<LogicalRole> {
    let columns: Vec<String> = match probe.probe_columns(name) {
        Ok(columns) => columns.into_iter().map(|c| c.to_ascii_lowercase()).collect(),
        Err(e) => {
            debug!("Column probe failed for {}: {}", name, e);
            return None;
        }
    };
    if columns.is_empty() {
        return None;
    }

    roles
        .iter()
        .copied()
        .find(|role| columns_satisfy(&columns, required_columns(*role)))
}

fn columns_satisfy(columns: &[String], groups: &[&[&str]]) -> bool {
    !groups.is_empty()
        && groups.iter().all(|needles| {
            columns
                .iter()
                .any(|column| needles.iter().any(|needle| column.contains(needle)))
        })
}

fn is_internal(name: &str, words: &[String]) -> bool {
    name.to_ascii_lowercase().starts_with("sqlite_") || words.iter().any(|word| word == "fts")
}

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,19}$").expect("valid regex"));
static HASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{8,}$").expect("valid regex"));
static TRAILING_DIGITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*[A-Za-z])(\d{1,19})$").expect("valid regex"));

/// Split a table name into its base and shard suffix.
///
/// `chat_msg_2021` → (`chat_msg`, 2021), `Chat_1d35…ee88` → (`Chat`, hash),
/// `MSG0` → (`MSG`, 0), `contact_main` → (`contact_main`, none).
pub fn split_shard(name: &str) -> (&str, Option<ShardKey>) {
    if let Some((base, suffix)) = name.rsplit_once('_') {
        if !base.is_empty() {
            if DIGITS.is_match(suffix) {
                if let Ok(n) = suffix.parse::<u64>() {
                    return (base, Some(ShardKey::Numeric(n)));
                }
            }
            if HASH.is_match(suffix) {
                return (base, Some(ShardKey::Text(suffix.to_ascii_lowercase())));
            }
        }
    }

    if let Some(caps) = TRAILING_DIGITS.captures(name) {
        if let (Some(base), Some(digits)) = (caps.get(1), caps.get(2)) {
            if let Ok(n) = digits.as_str().parse::<u64>() {
                return (&name[..base.end()], Some(ShardKey::Numeric(n)));
            }
        }
    }

    (name, None)
}

/// Lowercase tokens of a table base name plus adjacent-pair compounds, so
/// `ChatRoomMember` yields `chat`, `room`, `member`, `chatroom`, `roommember`.
fn name_words(base: &str) -> Vec<String> {
    let tokens = tokenize(base);
    let mut words = tokens.clone();
    for pair in tokens.windows(2) {
        words.push(format!("{}{}", pair[0], pair[1]));
    }
    words
}

fn tokenize(base: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for part in base.split(|c: char| c == '_' || c == '-' || c == ' ' || c == '.') {
        let chars: Vec<char> = part.chars().collect();
        let mut current = String::new();
        for (i, &c) in chars.iter().enumerate() {
            if i > 0 && !current.is_empty() {
                let prev = chars[i - 1];
                let next_is_lower = chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false);
                let boundary = (prev.is_lowercase() && c.is_uppercase())
                    || (prev.is_uppercase() && c.is_uppercase() && next_is_lower)
                    || (prev.is_ascii_digit() != c.is_ascii_digit());
                if boundary {
                    tokens.push(current.to_lowercase());
                    current.clear();
                }
            }
            current.push(c);
        }
        if !current.is_empty() {
            tokens.push(current.to_lowercase());
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticColumns(HashMap<&'static str, Vec<&'static str>>);

    impl ColumnProbe for StaticColumns {
        fn probe_columns(&self, table: &str) -> Result<Vec<String>, DecryptionError> {
            self.0
                .get(table)
                .map(|cols| cols.iter().map(|c| c.to_string()).collect())
                .ok_or_else(|| DecryptionError::Io(format!("no such table: {}", table)))
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn db() -> DatabaseId {
        DatabaseId::new("0011223344556677")
    }

    #[test]
    fn test_sharded_chat_and_contact_tables() {
        let tables = names(&["chat_msg_2021", "chat_msg_2022", "contact_main"]);
        let result = classify(&db(), &tables, &NoProbe);

        assert_eq!(result.role_of("chat_msg_2021"), Some(LogicalRole::ChatMessages));
        assert_eq!(result.role_of("chat_msg_2022"), Some(LogicalRole::ChatMessages));
        assert_eq!(result.role_of("contact_main"), Some(LogicalRole::ContactInfo));
        assert_eq!(result.tables[0].shard_key, Some(ShardKey::Numeric(2021)));
        assert_eq!(result.tables[2].shard_key, None);
    }

    #[test]
    fn test_wechat_macos_table_names() {
        let tables = names(&[
            "Chat_1d35a41b3adb8b335cc59362ad55ee88",
            "WCContact",
            "SessionAbstract",
            "HardLinkImageAttribute",
            "MSG0",
            "sqlite_sequence",
            "ChatCRMsg_fts_content",
        ]);
        let result = classify(&db(), &tables, &NoProbe);

        assert_eq!(
            result.role_of("Chat_1d35a41b3adb8b335cc59362ad55ee88"),
            Some(LogicalRole::ChatMessages)
        );
        assert_eq!(result.role_of("WCContact"), Some(LogicalRole::ContactInfo));
        assert_eq!(result.role_of("SessionAbstract"), Some(LogicalRole::SessionIndex));
        assert_eq!(result.role_of("HardLinkImageAttribute"), Some(LogicalRole::MediaIndex));
        assert_eq!(result.role_of("MSG0"), Some(LogicalRole::ChatMessages));
        assert_eq!(result.role_of("sqlite_sequence"), Some(LogicalRole::Unknown));
        assert_eq!(result.role_of("ChatCRMsg_fts_content"), Some(LogicalRole::Unknown));
        assert_eq!(
            result.tables[0].shard_key,
            Some(ShardKey::Text("1d35a41b3adb8b335cc59362ad55ee88".to_string()))
        );
    }

    #[test]
    fn test_unmatched_name_resolved_by_columns() {
        let probe = StaticColumns(HashMap::from([
            ("t_history", vec!["mesLocalID", "msgCreateTime", "msgContent"]),
            ("t_people", vec!["m_nsUsrName", "nickname", "m_nsRemark"]),
            ("t_misc", vec!["a", "b"]),
        ]));
        let tables = names(&["t_history", "t_people", "t_misc"]);
        let result = classify(&db(), &tables, &probe);

        assert_eq!(result.role_of("t_history"), Some(LogicalRole::ChatMessages));
        assert_eq!(result.tables[0].basis, ClassificationBasis::Columns);
        assert_eq!(result.role_of("t_people"), Some(LogicalRole::ContactInfo));
        assert_eq!(result.role_of("t_misc"), Some(LogicalRole::Unknown));
        assert_eq!(result.tables[2].basis, ClassificationBasis::Fallback);
    }

    #[test]
    fn test_ambiguous_name_uses_probe_within_candidates() {
        let probe = StaticColumns(HashMap::from([
            ("ChatRoomMember", vec!["chatroomname", "username", "displayname"]),
            ("ChatSession", vec!["id", "value"]),
        ]));
        let tables = names(&["ChatRoomMember", "ChatSession"]);
        let result = classify(&db(), &tables, &probe);

        assert_eq!(result.role_of("ChatRoomMember"), Some(LogicalRole::ContactInfo));
        assert_eq!(result.tables[0].basis, ClassificationBasis::Columns);
        // Probe inconclusive: first name candidate by precedence.
        assert_eq!(result.role_of("ChatSession"), Some(LogicalRole::SessionIndex));
        assert_eq!(result.tables[1].basis, ClassificationBasis::Name);
    }

    #[test]
    fn test_name_match_is_not_overridden_by_columns() {
        let probe = StaticColumns(HashMap::from([(
            "contact_main",
            vec!["talker", "createTime", "content"],
        )]));
        let result = classify(&db(), &names(&["contact_main"]), &probe);
        assert_eq!(result.role_of("contact_main"), Some(LogicalRole::ContactInfo));
    }

    #[test]
    fn test_probe_errors_never_escape() {
        let probe = StaticColumns(HashMap::new());
        let result = classify(&db(), &names(&["blob_store", "kv"]), &probe);
        assert!(result
            .tables
            .iter()
            .all(|t| t.role == LogicalRole::Unknown));
    }

    #[test]
    fn test_duplicate_names_get_one_role() {
        let result = classify(&db(), &names(&["Chat_1", "Chat_1"]), &NoProbe);
        assert_eq!(result.tables.len(), 1);
    }

    #[test]
    fn test_split_shard_variants() {
        assert_eq!(split_shard("chat_msg_2021"), ("chat_msg", Some(ShardKey::Numeric(2021))));
        assert_eq!(split_shard("MSG12"), ("MSG", Some(ShardKey::Numeric(12))));
        assert_eq!(split_shard("contact_main"), ("contact_main", None));
        assert_eq!(split_shard("_2021"), ("_2021", None));
        assert_eq!(split_shard("Chat"), ("Chat", None));
        assert_eq!(
            split_shard("Chat_DeadBeef"),
            ("Chat", Some(ShardKey::Text("deadbeef".to_string())))
        );
        assert_eq!(split_shard("Chat_cafe"), ("Chat_cafe", None));
    }

    #[test]
    fn test_tokenize_camel_case() {
        assert_eq!(tokenize("WCContact"), vec!["wc", "contact"]);
        assert_eq!(
            tokenize("HardLinkImageAttribute"),
            vec!["hard", "link", "image", "attribute"]
        );
        assert_eq!(tokenize("chat_msg"), vec!["chat", "msg"]);
    }
}
