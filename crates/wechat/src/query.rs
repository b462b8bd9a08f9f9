//! Query facade over the registry.
//!
//! Every call pins the live generation once and answers entirely from it.
//! Row streams keep their pinned generation and fail with
//! [`RegistryError::Stale`] as soon as a reload replaces it.

use crate::chat::{ChatColumns, ChatRecord};
use crate::contacts::{search_contacts, ContactRecord, ContactRowParser, WeChatContactParser};
use crate::error::{RegistryError, RegistryResult};
use crate::gateway::{RowPage, RowRange};
use crate::registry::{Generation, TableDescriptor, TableRegistry};
use crate::stats::RegistryStats;
use futures::stream::{self, Stream, StreamExt};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use wxindex_core::{DatabaseId, LogicalRole};

/// One row read from a table under some role.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleRow {
    /// Source database.
    pub database_id: DatabaseId,
    /// Source table.
    pub table: String,
    /// Column names shared by every row of the page.
    pub columns: Arc<Vec<String>>,
    /// Row values in column order.
    pub values: Vec<serde_json::Value>,
}

impl RoleRow {
    /// Value of `column`, if present.
    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get(index)
    }
}

/// Role-oriented read API.
#[derive(Clone)]
pub struct QueryFacade {
    registry: Arc<TableRegistry>,
    parser: Arc<dyn ContactRowParser>,
}

impl QueryFacade {
    /// Facade using the WeChat contact parser.
    pub fn new(registry: Arc<TableRegistry>) -> Self {
        Self::with_parser(registry, Arc::new(WeChatContactParser))
    }

    /// Facade using a custom contact parser.
    pub fn with_parser(registry: Arc<TableRegistry>, parser: Arc<dyn ContactRowParser>) -> Self {
        Self { registry, parser }
    }

    /// Underlying registry.
    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// See [`TableRegistry::tables_for`].
    pub fn tables_for(
        &self,
        id: &DatabaseId,
        role: LogicalRole,
    ) -> RegistryResult<Vec<TableDescriptor>> {
        self.registry.tables_for(id, role)
    }

    /// See [`TableRegistry::all_tables_for`].
    pub fn all_tables_for(&self, role: LogicalRole) -> Vec<(DatabaseId, TableDescriptor)> {
        self.registry.all_tables_for(role)
    }

    /// See [`TableRegistry::stats`].
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Tables under `role`, databases whose declared type agrees with the
    /// role first.
    pub fn best_tables(&self, role: LogicalRole) -> Vec<(DatabaseId, TableDescriptor)> {
        best_tables_in(&self.registry.snapshot(), role)
    }

    /// Read a window of rows from one table.
    pub async fn read_rows(
        &self,
        id: &DatabaseId,
        table: &str,
        range: RowRange,
    ) -> RegistryResult<RowPage> {
        read_page(&self.registry.snapshot(), id, table, range).await
    }

    /// Row count of one table, cached for the life of the generation.
    pub async fn row_count(&self, id: &DatabaseId, table: &str) -> RegistryResult<u64> {
        let generation = self.registry.snapshot();
        let key = (id.clone(), table.to_string());
        if let Some(count) = generation.row_counts.get(&key).map(|count| *count) {
            return Ok(count);
        }

        let entry = generation.database(id)?;
        if entry.role_of(table).is_none() {
            return Err(table_not_found(id, table));
        }
        let handle = entry.handle()?.lock_owned().await;
        let name = table.to_string();
        let count = tokio::task::spawn_blocking(move || handle.count_rows(&name))
            .await
            .map_err(|e| RegistryError::Internal(e.into()))??;

        generation.row_counts.insert(key, count);
        Ok(count)
    }

    /// Run a read-only statement against one database.
    pub async fn execute_query(&self, id: &DatabaseId, sql: &str) -> RegistryResult<RowPage> {
        let generation = self.registry.snapshot();
        let handle = generation.database(id)?.handle()?.lock_owned().await;
        let sql = sql.to_string();
        debug!("Executing query on {}: {}", id, sql);
        let page = tokio::task::spawn_blocking(move || handle.query(&sql))
            .await
            .map_err(|e| RegistryError::Internal(e.into()))??;
        Ok(page)
    }

    /// Lazily stream every row of every table under `role`, in
    /// [`all_tables_for`](Self::all_tables_for) order.
    pub fn stream_rows(
        &self,
        role: LogicalRole,
        batch_size: usize,
    ) -> impl Stream<Item = RegistryResult<RoleRow>> + Send + 'static {
        let generation = self.registry.snapshot();
        let tables = generation.all_tables_for(role);
        RowCursor::new(self.registry.clone(), generation, tables, batch_size).into_stream()
    }

    /// Every contact across contact tables, de-duplicated by username.
    pub async fn load_contacts(&self) -> RegistryResult<Arc<Vec<ContactRecord>>> {
        let generation = self.registry.snapshot();
        let batch_size = self.registry.config().read_batch_size;
        let contacts = generation
            .contacts
            .get_or_try_init(|| collect_contacts(&generation, self.parser.as_ref(), batch_size))
            .await?;
        Ok(contacts.clone())
    }

    /// Contacts whose display name contains `query`, sorted.
    pub async fn search_contacts(&self, query: &str) -> RegistryResult<Vec<ContactRecord>> {
        let contacts = self.load_contacts().await?;
        Ok(search_contacts(&contacts, query))
    }

    /// Normalized chat messages over every chat table, databases declared
    /// as message stores first.
    pub fn chat_records(
        &self,
        batch_size: usize,
    ) -> impl Stream<Item = RegistryResult<ChatRecord>> + Send + 'static {
        let generation = self.registry.snapshot();
        let tables = best_tables_in(&generation, LogicalRole::ChatMessages);
        let database_types: BTreeMap<DatabaseId, String> = generation
            .databases()
            .map(|entry| (entry.id().clone(), entry.descriptor.declared_type.clone()))
            .collect();

        let mut layout: Option<(Arc<Vec<String>>, ChatColumns)> = None;
        RowCursor::new(self.registry.clone(), generation, tables, batch_size)
            .into_stream()
            .map(move |row: RegistryResult<RoleRow>| -> RegistryResult<ChatRecord> {
                let row = row?;
                let cached = layout
                    .as_ref()
                    .filter(|(names, _)| Arc::ptr_eq(names, &row.columns))
                    .map(|(_, columns)| columns.clone());
                let columns = match cached {
                    Some(columns) => columns,
                    None => {
                        let columns = ChatColumns::resolve(&row.columns);
                        layout = Some((row.columns.clone(), columns.clone()));
                        columns
                    }
                };
                let database_type = database_types
                    .get(&row.database_id)
                    .map(String::as_str)
                    .unwrap_or(wxindex_core::constants::UNKNOWN_DECLARED_TYPE);
                Ok(columns.normalize(
                    &row.database_id,
                    database_type,
                    &row.table,
                    &row.columns,
                    &row.values,
                ))
            })
    }
}

fn best_tables_in(generation: &Generation, role: LogicalRole) -> Vec<(DatabaseId, TableDescriptor)> {
    let (mut agreeing, others): (Vec<_>, Vec<_>) = generation
        .databases()
        .filter(|entry| entry.is_accessible() && !entry.tables(role).is_empty())
        .partition(|entry| entry.declared_role() == Some(role));
    agreeing.extend(others);

    agreeing
        .into_iter()
        .flat_map(|entry| {
            generation
                .tables_for(entry.id(), role)
                .unwrap_or_default()
                .into_iter()
                .map(move |table| (entry.id().clone(), table))
        })
        .collect()
}

async fn read_page(
    generation: &Generation,
    id: &DatabaseId,
    table: &str,
    range: RowRange,
) -> RegistryResult<RowPage> {
    let entry = generation.database(id)?;
    if entry.role_of(table).is_none() {
        return Err(table_not_found(id, table));
    }
    let handle = entry.handle()?.lock_owned().await;
    let name = table.to_string();
    let page = tokio::task::spawn_blocking(move || handle.read_rows(&name, range))
        .await
        .map_err(|e| RegistryError::Internal(e.into()))??;
    Ok(page)
}

async fn collect_contacts(
    generation: &Generation,
    parser: &dyn ContactRowParser,
    batch_size: usize,
) -> RegistryResult<Arc<Vec<ContactRecord>>> {
    let mut seen = HashSet::new();
    let mut contacts = Vec::new();
    let batch = batch_size.max(1) as u64;

    for (id, table) in generation.all_tables_for(LogicalRole::ContactInfo) {
        let mut offset = 0;
        loop {
            let page = read_page(generation, &id, &table.name, RowRange::new(offset, batch)).await?;
            for row in &page.rows {
                if let Some(contact) = parser.parse(&id, &table.name, &page.columns, row) {
                    if seen.insert(contact.username.clone()) {
                        contacts.push(contact);
                    }
                }
            }
            if (page.len() as u64) < batch {
                break;
            }
            offset += batch;
        }
    }

    info!(
        "Loaded {} contacts for generation {}",
        contacts.len(),
        generation.id()
    );
    Ok(Arc::new(contacts))
}

fn table_not_found(id: &DatabaseId, table: &str) -> RegistryError {
    RegistryError::TableNotFound {
        database: id.clone(),
        table: table.to_string(),
    }
}

/// Paging cursor over a fixed table list of one pinned generation.
struct RowCursor {
    registry: Arc<TableRegistry>,
    generation: Arc<Generation>,
    tables: VecDeque<(DatabaseId, TableDescriptor)>,
    offset: u64,
    batch_size: u64,
    buffered: VecDeque<RoleRow>,
    done: bool,
}

impl RowCursor {
    fn new(
        registry: Arc<TableRegistry>,
        generation: Arc<Generation>,
        tables: Vec<(DatabaseId, TableDescriptor)>,
        batch_size: usize,
    ) -> Self {
        Self {
            registry,
            generation,
            tables: tables.into(),
            offset: 0,
            batch_size: batch_size.max(1) as u64,
            buffered: VecDeque::new(),
            done: false,
        }
    }

    fn into_stream(self) -> impl Stream<Item = RegistryResult<RoleRow>> + Send + 'static {
        stream::unfold(self, |mut cursor| async move {
            cursor.next_row().await.map(|item| (item, cursor))
        })
    }

    async fn next_row(&mut self) -> Option<RegistryResult<RoleRow>> {
        loop {
            if self.done {
                return None;
            }
            if let Err(e) = self.registry.ensure_current(&self.generation) {
                self.done = true;
                return Some(Err(e));
            }
            if let Some(row) = self.buffered.pop_front() {
                return Some(Ok(row));
            }

            let (id, table) = match self.tables.front() {
                Some((id, table)) => (id.clone(), table.name.clone()),
                None => {
                    self.done = true;
                    return None;
                }
            };
            let range = RowRange::new(self.offset, self.batch_size);
            let page = match read_page(&self.generation, &id, &table, range).await {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let read = page.len() as u64;
            if read < self.batch_size {
                self.tables.pop_front();
                self.offset = 0;
            } else {
                self.offset += read;
            }

            let columns = Arc::new(page.columns);
            self.buffered.extend(page.rows.into_iter().map(|values| RoleRow {
                database_id: id.clone(),
                table: table.clone(),
                columns: columns.clone(),
                values,
            }));
        }
    }
}
