use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use wxindex_core::config::RegistryConfig;
use wxindex_core::{LogicalRole, RegistryState, ShardKey};
use wxindex_wechat::gateway::ColumnInfo;
use wxindex_wechat::manifest::database_id_for_path;
use wxindex_wechat::{
    descriptors_from_manifest, DatabaseDescriptor, DatabaseHandle, DatabaseStatus,
    DecryptionError, DecryptionGateway, ManifestEntry, ManifestError, QueryFacade,
    RegistryError, RowPage, RowRange, TableRegistry,
};

#[derive(Clone)]
struct FakeTable {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl FakeTable {
    fn new(name: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }
}

#[derive(Clone)]
struct FakeDb {
    key: String,
    tables: Vec<FakeTable>,
}

/// Blocks opens of one path until released.
struct Gate {
    path: PathBuf,
    released: Mutex<bool>,
    signal: Condvar,
}

impl Gate {
    fn new(path: &str) -> Arc<Self> {
        Arc::new(Self {
            path: PathBuf::from(path),
            released: Mutex::new(false),
            signal: Condvar::new(),
        })
    }

    fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.signal.notify_all();
    }

    fn wait(&self) {
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.signal.wait(released).unwrap();
        }
    }
}

#[derive(Default)]
struct FakeGateway {
    databases: HashMap<PathBuf, FakeDb>,
    gate: Option<Arc<Gate>>,
}

impl FakeGateway {
    fn with_db(mut self, path: &str, key: &str, tables: Vec<FakeTable>) -> Self {
        self.databases.insert(
            PathBuf::from(path),
            FakeDb {
                key: key.to_string(),
                tables,
            },
        );
        self
    }

    fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl DecryptionGateway for FakeGateway {
    fn open(&self, path: &Path, key: &str) -> Result<Box<dyn DatabaseHandle>, DecryptionError> {
        if let Some(gate) = &self.gate {
            if gate.path == path {
                gate.wait();
            }
        }
        let db = self
            .databases
            .get(path)
            .ok_or_else(|| DecryptionError::FileNotFound(path.display().to_string()))?;
        if db.key != key {
            return Err(DecryptionError::BadKey(path.display().to_string()));
        }
        Ok(Box::new(FakeHandle {
            tables: db.tables.clone(),
        }))
    }
}

struct FakeHandle {
    tables: Vec<FakeTable>,
}

impl FakeHandle {
    fn table(&self, name: &str) -> Result<&FakeTable, DecryptionError> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| DecryptionError::Io(format!("no such table: {}", name)))
    }
}

impl DatabaseHandle for FakeHandle {
    fn list_tables(&self) -> Result<Vec<String>, DecryptionError> {
        Ok(self.tables.iter().map(|t| t.name.clone()).collect())
    }

    fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>, DecryptionError> {
        if table.starts_with("explode") {
            panic!("schema read blew up for {}", table);
        }
        Ok(self
            .tables
            .iter()
            .find(|t| t.name == table)
            .map(|t| {
                t.columns
                    .iter()
                    .map(|name| ColumnInfo {
                        name: name.clone(),
                        type_name: "TEXT".to_string(),
                        nullable: true,
                        primary_key: false,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn count_rows(&self, table: &str) -> Result<u64, DecryptionError> {
        Ok(self.table(table)?.rows.len() as u64)
    }

    fn read_rows(&self, table: &str, range: RowRange) -> Result<RowPage, DecryptionError> {
        let table = self.table(table)?;
        let start = (range.offset as usize).min(table.rows.len());
        let end = match range.limit {
            Some(limit) => (start + limit as usize).min(table.rows.len()),
            None => table.rows.len(),
        };
        Ok(RowPage {
            columns: table.columns.clone(),
            rows: table.rows[start..end].to_vec(),
        })
    }

    fn query(&self, sql: &str) -> Result<RowPage, DecryptionError> {
        Ok(RowPage {
            columns: vec!["sql".to_string()],
            rows: vec![vec![json!(sql)]],
        })
    }
}

const MSG_DB: &str = "/fake/Message/msg_0.db";
const CONTACT_DB: &str = "/fake/Contact/wccontact_new2.db";
const LOCKED_DB: &str = "/fake/Message/msg_1.db";

fn chat_table(name: &str, rows: usize) -> FakeTable {
    FakeTable::new(
        name,
        &["localId", "talker", "createTime", "content"],
        (0..rows)
            .map(|i| {
                vec![
                    json!(i),
                    json!("wxid_peer"),
                    json!(1_600_000_000 + i as i64),
                    json!(format!("{} #{}", name, i)),
                ]
            })
            .collect(),
    )
}

fn contact_table(name: &str, rows: &[(&str, &str, &str)]) -> FakeTable {
    FakeTable::new(
        name,
        &["UsrName", "NickName", "Remark"],
        rows.iter()
            .map(|(user, nick, remark)| vec![json!(user), json!(nick), json!(remark)])
            .collect(),
    )
}

fn standard_gateway() -> FakeGateway {
    FakeGateway::default()
        .with_db(
            MSG_DB,
            "k1",
            vec![
                chat_table("chat_msg_2022", 3),
                chat_table("chat_msg_2021", 2),
                contact_table("contact_main", &[("wxid_a", "Alice", "")]),
                FakeTable::new("sqlite_sequence", &["name", "seq"], vec![]),
            ],
        )
        .with_db(
            CONTACT_DB,
            "k2",
            vec![contact_table(
                "Friend",
                &[
                    ("wxid_b", "bob", "Bobby"),
                    ("wxid_a", "Alice Dup", ""),
                    ("wxid_c", "Carol", ""),
                ],
            )],
        )
        .with_db(LOCKED_DB, "right", vec![chat_table("Chat_locked", 1)])
}

fn descriptors(entries: &[(&str, &str)]) -> Result<Vec<DatabaseDescriptor>, Box<dyn std::error::Error>> {
    let manifest: Vec<ManifestEntry> = entries
        .iter()
        .map(|(path, key)| ManifestEntry::new(*path, *key))
        .collect();
    Ok(descriptors_from_manifest(&manifest)?)
}

fn registry(gateway: FakeGateway) -> Arc<TableRegistry> {
    Arc::new(TableRegistry::new(
        Arc::new(gateway),
        RegistryConfig::default(),
    ))
}

#[tokio::test]
async fn test_wrong_key_database_is_inaccessible() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry(standard_gateway());
    let report = registry
        .initialize(descriptors(&[(MSG_DB, "k1"), (LOCKED_DB, "wrong")])?)
        .await?;

    assert_eq!(report.databases.len(), 2);
    assert_eq!(report.accessible(), 1);

    let stats = registry.stats();
    assert_eq!(stats.state, RegistryState::Ready);
    assert_eq!(stats.total_databases, 2);
    assert_eq!(stats.accessible_databases, 1);
    assert_eq!(stats.accessibility_rate(), 0.5);

    let locked_id = database_id_for_path(LOCKED_DB);
    let locked = registry.database(&locked_id)?;
    assert!(matches!(
        locked.status,
        DatabaseStatus::Inaccessible {
            reason: DecryptionError::BadKey(_)
        }
    ));
    for role in LogicalRole::ALL {
        assert!(registry.tables_for(&locked_id, role)?.is_empty());
        assert!(registry
            .all_tables_for(role)
            .iter()
            .all(|(id, _)| *id != locked_id));
    }

    Ok(())
}

#[tokio::test]
async fn test_shards_are_ordered_by_key() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry(standard_gateway());
    registry.initialize(descriptors(&[(MSG_DB, "k1")])?).await?;
    let id = database_id_for_path(MSG_DB);

    let chat = registry.tables_for(&id, LogicalRole::ChatMessages)?;
    let names: Vec<&str> = chat.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["chat_msg_2021", "chat_msg_2022"]);
    assert_eq!(chat[0].shard_key, Some(ShardKey::Numeric(2021)));
    assert!(chat.iter().all(|t| t.role == LogicalRole::ChatMessages));

    let contact = registry.tables_for(&id, LogicalRole::ContactInfo)?;
    assert_eq!(contact.len(), 1);
    assert_eq!(contact[0].name, "contact_main");

    let unknown = registry.tables_for(&id, LogicalRole::Unknown)?;
    assert_eq!(unknown[0].name, "sqlite_sequence");

    let first = registry.all_tables_for(LogicalRole::ChatMessages);
    assert_eq!(first, registry.all_tables_for(LogicalRole::ChatMessages));

    Ok(())
}

#[tokio::test]
async fn test_unknown_database_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry(standard_gateway());
    registry.initialize(descriptors(&[(MSG_DB, "k1")])?).await?;

    let missing = database_id_for_path("/fake/nowhere.db");
    let result = registry.tables_for(&missing, LogicalRole::ChatMessages);
    assert!(matches!(result, Err(RegistryError::NotFound(_))));

    Ok(())
}

#[tokio::test]
async fn test_empty_manifest_yields_ready_registry() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry(standard_gateway());
    let report = registry.initialize(Vec::new()).await?;

    assert!(report.databases.is_empty());
    let stats = registry.stats();
    assert_eq!(stats.state, RegistryState::Ready);
    assert_eq!(stats.total_databases, 0);
    assert_eq!(stats.accessibility_rate(), 0.0);

    Ok(())
}

#[tokio::test]
async fn test_contacts_merge_and_search() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry(standard_gateway());
    registry
        .initialize(descriptors(&[(MSG_DB, "k1"), (CONTACT_DB, "k2")])?)
        .await?;
    let facade = QueryFacade::new(registry.clone());

    let contacts = facade.load_contacts().await?;
    let mut usernames: Vec<&str> = contacts.iter().map(|c| c.username.as_str()).collect();
    usernames.sort_unstable();
    assert_eq!(usernames, vec!["wxid_a", "wxid_b", "wxid_c"]);

    let all = facade.search_contacts("  ").await?;
    assert_eq!(all, *contacts);

    let found = facade.search_contacts("BOB").await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].display_name, "Bobby");

    Ok(())
}

#[tokio::test]
async fn test_best_tables_prefers_declared_type() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry(standard_gateway());
    registry
        .initialize(descriptors(&[(MSG_DB, "k1"), (CONTACT_DB, "k2")])?)
        .await?;
    let facade = QueryFacade::new(registry.clone());

    let contact_id = database_id_for_path(CONTACT_DB);
    let best = facade.best_tables(LogicalRole::ContactInfo);
    assert_eq!(best.len(), 2);
    assert_eq!(best[0].0, contact_id);
    assert_eq!(best[0].1.name, "Friend");

    Ok(())
}

#[tokio::test]
async fn test_read_rows_and_row_count() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry(standard_gateway());
    registry.initialize(descriptors(&[(MSG_DB, "k1")])?).await?;
    let facade = QueryFacade::new(registry.clone());
    let id = database_id_for_path(MSG_DB);

    let page = facade
        .read_rows(&id, "chat_msg_2022", RowRange::new(1, 10))
        .await?;
    assert_eq!(page.len(), 2);
    assert_eq!(facade.row_count(&id, "chat_msg_2022").await?, 3);

    let cached = registry.tables_for(&id, LogicalRole::ChatMessages)?;
    assert_eq!(cached[1].row_count, Some(3));

    let missing = facade.read_rows(&id, "nope", RowRange::default()).await;
    assert!(matches!(missing, Err(RegistryError::TableNotFound { .. })));

    Ok(())
}

#[tokio::test]
async fn test_stream_rows_crosses_shards_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry(standard_gateway());
    registry.initialize(descriptors(&[(MSG_DB, "k1")])?).await?;
    let facade = QueryFacade::new(registry.clone());

    let rows: Vec<_> = facade
        .stream_rows(LogicalRole::ChatMessages, 2)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;
    let tables: Vec<&str> = rows.iter().map(|r| r.table.as_str()).collect();
    assert_eq!(
        tables,
        vec![
            "chat_msg_2021",
            "chat_msg_2021",
            "chat_msg_2022",
            "chat_msg_2022",
            "chat_msg_2022"
        ]
    );

    let records: Vec<_> = facade.chat_records(10).collect::<Vec<_>>().await;
    assert_eq!(records.len(), 5);
    let first = records[0].as_ref().map_err(|e| e.to_string())?;
    assert_eq!(first.content, Some(json!("chat_msg_2021 #0")));
    assert!(first.timestamp.is_some());
    assert_eq!(first.database_type, "Message");

    Ok(())
}

#[tokio::test]
async fn test_stream_fails_stale_after_reload() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry(standard_gateway());
    registry.initialize(descriptors(&[(MSG_DB, "k1")])?).await?;
    let facade = QueryFacade::new(registry.clone());

    let mut stream = Box::pin(facade.stream_rows(LogicalRole::ChatMessages, 1));
    let first = stream.next().await.ok_or("empty stream")??;
    assert_eq!(first.table, "chat_msg_2021");

    registry
        .reload(descriptors(&[(MSG_DB, "k1"), (CONTACT_DB, "k2")])?)
        .await?;

    let next = stream.next().await.ok_or("stream ended early")?;
    assert!(matches!(next, Err(RegistryError::Stale { .. })));
    assert!(stream.next().await.is_none());

    Ok(())
}

#[tokio::test]
async fn test_queries_served_from_previous_generation_during_reload(
) -> Result<(), Box<dyn std::error::Error>> {
    let gate = Gate::new(CONTACT_DB);
    let registry = registry(standard_gateway().with_gate(gate.clone()));
    registry.initialize(descriptors(&[(MSG_DB, "k1")])?).await?;
    let generation = registry.snapshot().id();

    let reloading = {
        let registry = registry.clone();
        let next = descriptors(&[(MSG_DB, "k1"), (CONTACT_DB, "k2")])?;
        tokio::spawn(async move { registry.reload(next).await })
    };

    while registry.state() != RegistryState::Initializing {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(registry.snapshot().id(), generation);
    assert_eq!(registry.databases().len(), 1);
    assert_eq!(registry.all_tables_for(LogicalRole::ChatMessages).len(), 2);

    let partial = registry.stats();
    assert_eq!(partial.state, RegistryState::Initializing);
    assert_eq!(partial.total_databases, 2);
    assert!(partial.accessible_databases <= 1);
    assert!(partial.generation > generation);

    // The ungated database finishes while the other is still held.
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.stats().accessible_databases < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    let partial = registry.stats();
    assert_eq!(partial.state, RegistryState::Initializing);
    assert_eq!(partial.total_databases, 2);
    assert_eq!(partial.accessible_databases, 1);

    gate.release();
    let report = reloading.await??;
    assert!(report.generation > generation);
    assert_eq!(registry.databases().len(), 2);
    assert_eq!(registry.state(), RegistryState::Ready);

    Ok(())
}

#[tokio::test]
async fn test_duplicate_database_ids_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry(standard_gateway());
    registry.initialize(descriptors(&[(MSG_DB, "k1")])?).await?;
    let generation = registry.snapshot().id();

    let contact = DatabaseDescriptor::from_entry(&ManifestEntry::new(CONTACT_DB, "k2"));
    let result = registry
        .reload(vec![contact.clone(), contact.clone()])
        .await;
    match result {
        Err(RegistryError::Manifest(ManifestError::DuplicateDatabase { id, .. })) => {
            assert_eq!(id, contact.id);
        }
        other => panic!("expected duplicate id rejection, got {:?}", other.map(|r| r.generation)),
    }

    assert_eq!(registry.state(), RegistryState::Ready);
    assert_eq!(registry.snapshot().id(), generation);
    let stats = registry.stats();
    assert_eq!(stats.total_databases, 1);

    let report = registry.reload(vec![contact]).await?;
    assert_eq!(report.databases.len(), 1);
    assert_eq!(registry.stats().total_databases, 1);

    Ok(())
}

#[tokio::test]
async fn test_newer_load_supersedes_older() -> Result<(), Box<dyn std::error::Error>> {
    let gate = Gate::new(CONTACT_DB);
    let registry = registry(standard_gateway().with_gate(gate.clone()));

    let slow = {
        let registry = registry.clone();
        let first = descriptors(&[(CONTACT_DB, "k2")])?;
        tokio::spawn(async move { registry.initialize(first).await })
    };
    while registry.state() != RegistryState::Initializing {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = registry.reload(descriptors(&[(MSG_DB, "k1")])?).await?;
    gate.release();

    let superseded = slow.await?;
    assert!(matches!(superseded, Err(RegistryError::Stale { .. })));
    assert_eq!(registry.snapshot().id(), report.generation);
    assert_eq!(registry.databases().len(), 1);
    assert_eq!(registry.databases()[0].id, database_id_for_path(MSG_DB));

    Ok(())
}

#[tokio::test]
async fn test_classification_panic_degrades_to_unknown() -> Result<(), Box<dyn std::error::Error>> {
    let path = "/fake/Misc/odd.db";
    let gateway = FakeGateway::default().with_db(
        path,
        "k",
        vec![
            FakeTable::new("chat_1", &["content"], vec![]),
            FakeTable::new("explode_here", &["a"], vec![]),
        ],
    );
    let registry = registry(gateway);
    let report = registry.initialize(descriptors(&[(path, "k")])?).await?;
    assert_eq!(report.accessible(), 1);

    let id = database_id_for_path(path);
    assert!(registry.tables_for(&id, LogicalRole::ChatMessages)?.is_empty());
    assert_eq!(registry.tables_for(&id, LogicalRole::Unknown)?.len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_close_drops_everything() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry(standard_gateway());
    registry.initialize(descriptors(&[(MSG_DB, "k1")])?).await?;
    registry.close();

    assert_eq!(registry.state(), RegistryState::Uninitialized);
    assert!(registry.databases().is_empty());
    assert_eq!(registry.stats().total_databases, 0);

    Ok(())
}
