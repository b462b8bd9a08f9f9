//! Contact extraction and search.

use icu_collator::{Collator, CollatorOptions, Strength};
use icu_locid::locale;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::warn;
use wxindex_core::DatabaseId;

/// One contact parsed from a contact table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    /// Account identifier (`wxid_...` or a custom id).
    pub username: String,
    /// Name shown to the user.
    pub display_name: String,
    /// Profile nickname.
    pub nickname: Option<String>,
    /// Remark set by the account owner.
    pub remark: Option<String>,
    /// Public alias.
    pub alias: Option<String>,
    /// Database the row came from.
    pub database_id: DatabaseId,
    /// Table the row came from.
    pub table: String,
}

/// Turns one contact table row into a [`ContactRecord`].
pub trait ContactRowParser: Send + Sync {
    /// Parse a row; `None` skips it.
    fn parse(
        &self,
        database_id: &DatabaseId,
        table: &str,
        columns: &[String],
        row: &[serde_json::Value],
    ) -> Option<ContactRecord>;
}

/// Parser for WeChat contact table layouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeChatContactParser;

const USERNAME_COLUMNS: &[&str] = &["usrname", "username", "user_name", "wxid"];
const REMARK_COLUMNS: &[&str] = &["remark", "conremark"];
const NICKNAME_COLUMNS: &[&str] = &["nickname", "nick_name", "nick"];
const ALIAS_COLUMNS: &[&str] = &["alias"];

impl ContactRowParser for WeChatContactParser {
    fn parse(
        &self,
        database_id: &DatabaseId,
        table: &str,
        columns: &[String],
        row: &[serde_json::Value],
    ) -> Option<ContactRecord> {
        let field = |candidates: &[&str]| -> Option<String> {
            let index = columns.iter().position(|column| {
                candidates
                    .iter()
                    .any(|candidate| column.eq_ignore_ascii_case(candidate))
            })?;
            text_value(row.get(index)?)
        };

        let username = field(USERNAME_COLUMNS)?;
        let remark = field(REMARK_COLUMNS);
        let nickname = field(NICKNAME_COLUMNS);
        let alias = field(ALIAS_COLUMNS);
        let display_name = remark
            .clone()
            .or_else(|| nickname.clone())
            .or_else(|| alias.clone())
            .unwrap_or_else(|| username.clone());

        Some(ContactRecord {
            username,
            display_name,
            nickname,
            remark,
            alias,
            database_id: database_id.clone(),
            table: table.to_string(),
        })
    }
}

fn text_value(value: &serde_json::Value) -> Option<String> {
    let text = match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Filter contacts by display name.
///
/// A blank query returns every contact in input order. Otherwise matches are
/// case-insensitive substrings of the display name, taken exactly as given,
/// sorted by locale collation, then caselessly, then by exact display name,
/// then by username.
pub fn search_contacts(contacts: &[ContactRecord], query: &str) -> Vec<ContactRecord> {
    if query.trim().is_empty() {
        return contacts.to_vec();
    }
    let needle = query.to_lowercase();

    let mut matches: Vec<ContactRecord> = contacts
        .iter()
        .filter(|contact| contact.display_name.to_lowercase().contains(&needle))
        .cloned()
        .collect();

    let collator = display_collator();
    matches.sort_by(|a, b| compare_display(collator.as_ref(), a, b));
    matches
}

/// Chinese collation (pinyin for Han), ignoring case so the caseless
/// tie-break below decides between names that differ only in case.
fn display_collator() -> Option<Collator> {
    let mut options = CollatorOptions::new();
    options.strength = Some(Strength::Secondary);
    match Collator::try_new(&locale!("zh").into(), options) {
        Ok(collator) => Some(collator),
        Err(e) => {
            warn!("Collator unavailable, sorting contacts by code point: {}", e);
            None
        }
    }
}

fn compare_display(collator: Option<&Collator>, a: &ContactRecord, b: &ContactRecord) -> Ordering {
    collator
        .map(|collator| collator.compare(&a.display_name, &b.display_name))
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
        })
        .then_with(|| a.display_name.cmp(&b.display_name))
        .then_with(|| a.username.cmp(&b.username))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contact(username: &str, display: &str) -> ContactRecord {
        ContactRecord {
            username: username.to_string(),
            display_name: display.to_string(),
            nickname: None,
            remark: None,
            alias: None,
            database_id: DatabaseId::from("db"),
            table: "contact".to_string(),
        }
    }

    #[test]
    fn test_display_name_preference() {
        let parser = WeChatContactParser;
        let columns: Vec<String> = ["UsrName", "NickName", "Remark", "Alias"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let id = DatabaseId::from("db");

        let with_remark = parser
            .parse(&id, "Friend", &columns, &[json!("wxid_1"), json!("Nick"), json!("Boss"), json!("a1")])
            .unwrap();
        assert_eq!(with_remark.display_name, "Boss");

        let blank_remark = parser
            .parse(&id, "Friend", &columns, &[json!("wxid_2"), json!("Nick"), json!("  "), json!(null)])
            .unwrap();
        assert_eq!(blank_remark.display_name, "Nick");
        assert_eq!(blank_remark.remark, None);

        let bare = parser
            .parse(&id, "Friend", &columns, &[json!("wxid_3"), json!(null), json!(null), json!(null)])
            .unwrap();
        assert_eq!(bare.display_name, "wxid_3");
    }

    #[test]
    fn test_rows_without_username_are_skipped() {
        let columns = vec!["nickname".to_string()];
        let parsed = WeChatContactParser.parse(&DatabaseId::from("db"), "t", &columns, &[json!("x")]);
        assert!(parsed.is_none());
    }

    #[test]
    fn test_blank_query_returns_input_unchanged() {
        let contacts = vec![contact("b", "Zed"), contact("a", "amy")];
        assert_eq!(search_contacts(&contacts, ""), contacts);
        assert_eq!(search_contacts(&contacts, "   "), contacts);
    }

    #[test]
    fn test_search_is_caseless_and_sorted() {
        let contacts = vec![
            contact("u3", "Annie"),
            contact("u1", "anna"),
            contact("u2", "Bob"),
            contact("u4", "Anna"),
            contact("u0", "Anna"),
        ];
        let found = search_contacts(&contacts, "ANN");
        let names: Vec<(&str, &str)> = found
            .iter()
            .map(|c| (c.display_name.as_str(), c.username.as_str()))
            .collect();
        assert_eq!(
            names,
            vec![("Anna", "u0"), ("Anna", "u4"), ("anna", "u1"), ("Annie", "u3")]
        );
    }

    #[test]
    fn test_query_whitespace_is_significant() {
        let contacts = vec![contact("u1", "John Smith"), contact("u2", "Johnny")];

        let trailing: Vec<String> = search_contacts(&contacts, "john ")
            .into_iter()
            .map(|c| c.display_name)
            .collect();
        assert_eq!(trailing, vec!["John Smith"]);

        let inner: Vec<String> = search_contacts(&contacts, "n s")
            .into_iter()
            .map(|c| c.display_name)
            .collect();
        assert_eq!(inner, vec!["John Smith"]);

        assert!(search_contacts(&contacts, " johnny").is_empty());
    }

    #[test]
    fn test_sort_uses_collation_for_accents_and_case() {
        let contacts = vec![
            contact("u1", "frank"),
            contact("u2", "Émile"),
            contact("u3", "Eddie"),
            contact("u4", "eve"),
            contact("u5", "Zoë Fields"),
        ];
        let names: Vec<String> = search_contacts(&contacts, "e")
            .into_iter()
            .map(|c| c.display_name)
            .collect();
        assert_eq!(names, vec!["Eddie", "Émile", "eve", "Zoë Fields"]);
    }
}
