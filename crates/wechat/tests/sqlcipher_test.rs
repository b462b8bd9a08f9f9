//! Gateway tests against real SQLite files. Plain SQLite ignores the key
//! pragmas, so these only run without the `sqlcipher` feature.
#![cfg(not(feature = "sqlcipher"))]

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use serde_json::json;
use tempfile::TempDir;
use wxindex_core::config::RegistryConfig;
use wxindex_core::LogicalRole;
use wxindex_wechat::manifest::database_id_for_path;
use wxindex_wechat::{
    descriptors_from_manifest, DecryptionError, DecryptionGateway, ManifestEntry, QueryFacade,
    RowRange, SqlCipherGateway, TableRegistry,
};

fn create_message_db(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE Chat_0 (mesLocalID INTEGER PRIMARY KEY, msgCreateTime INTEGER, msgContent TEXT, messageType INTEGER);
         CREATE TABLE Chat_1 (mesLocalID INTEGER PRIMARY KEY, msgCreateTime INTEGER, msgContent TEXT, messageType INTEGER);
         CREATE TABLE Friend (UsrName TEXT, NickName TEXT, Remark TEXT, Alias TEXT, ExtraBuf BLOB);
         INSERT INTO Chat_0 VALUES (1, 1600000000, 'hello', 1);
         INSERT INTO Chat_1 VALUES (1, 1600000001000, 'later', 1);
         INSERT INTO Friend VALUES ('wxid_x', 'Xavier', '', 'xav', x'ff00');",
    )?;
    Ok(())
}

#[tokio::test]
async fn test_plain_database_opens_and_classifies() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let message_dir = dir.path().join("Message");
    std::fs::create_dir_all(&message_dir)?;
    let db_path = message_dir.join("msg_0.db");
    create_message_db(&db_path)?;
    let path = db_path.to_string_lossy().to_string();

    let registry = Arc::new(TableRegistry::new(
        Arc::new(SqlCipherGateway::default()),
        RegistryConfig {
            count_rows_on_load: true,
            ..RegistryConfig::default()
        },
    ));
    let descriptors = descriptors_from_manifest(&[ManifestEntry::new(path.clone(), "x'00ff'")])?;
    let report = registry.initialize(descriptors).await?;
    assert_eq!(report.accessible(), 1);

    let id = database_id_for_path(&path);
    let chat = registry.tables_for(&id, LogicalRole::ChatMessages)?;
    let names: Vec<&str> = chat.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["Chat_0", "Chat_1"]);
    assert_eq!(chat[1].row_count, Some(1));

    let facade = QueryFacade::new(registry.clone());
    let page = facade.read_rows(&id, "Friend", RowRange::default()).await?;
    assert_eq!(page.columns[0], "UsrName");
    assert_eq!(page.rows[0][4], json!("ff00"));

    let contacts = facade.load_contacts().await?;
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].display_name, "Xavier");

    let result = facade
        .execute_query(&id, "SELECT count(*) AS n FROM Chat_0")
        .await?;
    assert_eq!(result.rows, vec![vec![json!(1)]]);

    let written = facade
        .execute_query(&id, "INSERT INTO Chat_0 VALUES (2, 0, 'x', 1)")
        .await;
    assert!(written.is_err());

    Ok(())
}

#[test]
fn test_missing_file_is_file_not_found() {
    let gateway = SqlCipherGateway::default();
    let result = gateway.open(Path::new("/definitely/not/here.db"), "key");
    assert!(matches!(result, Err(DecryptionError::FileNotFound(_))));
}

#[test]
fn test_short_file_is_corrupt_header() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("tiny.db");
    std::fs::write(&path, b"SQLite")?;

    let result = SqlCipherGateway::default().open(&path, "key");
    assert!(matches!(result, Err(DecryptionError::CorruptHeader(_))));
    Ok(())
}

#[test]
fn test_garbage_file_is_bad_key() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("encrypted.db");
    std::fs::write(&path, vec![0x5au8; 4096])?;

    let result = SqlCipherGateway::default().open(&path, "key");
    assert!(matches!(result, Err(DecryptionError::BadKey(_))));
    Ok(())
}
