//! Table mapping registry.
//!
//! The registry owns one [`Generation`] at a time: every open handle and the
//! `(database, role) → tables` mapping built from one manifest. Loads build a
//! complete generation off to the side and swap it in atomically, so readers
//! see either the previous generation or the new one, never a mix. A newer
//! load supersedes an older in-flight one; the older load's results and
//! handles are dropped.

use crate::classifier::{classify, Classification, NoProbe};
use crate::contacts::ContactRecord;
use crate::error::{DecryptionError, ManifestError, RegistryError, RegistryResult};
use crate::gateway::{DatabaseHandle, DecryptionGateway};
use crate::manifest::DatabaseDescriptor;
use crate::stats::{aggregate, RegistryStats};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use wxindex_core::config::RegistryConfig;
use wxindex_core::{DatabaseId, LogicalRole, RegistryState, ShardKey};

/// Handle shared between the registry entry and in-flight reads. The mutex
/// serializes reads per database.
pub(crate) type SharedHandle = Arc<tokio::sync::Mutex<Box<dyn DatabaseHandle>>>;

/// One classified physical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Physical table name.
    pub name: String,
    /// Database the table lives in.
    pub database_id: DatabaseId,
    /// Assigned logical role.
    pub role: LogicalRole,
    /// Shard suffix extracted from the name.
    pub shard_key: Option<ShardKey>,
    /// Row count, once known.
    pub row_count: Option<u64>,
}

/// Whether a database could be opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DatabaseStatus {
    /// Opened and classified.
    Accessible,
    /// Loaded but unreadable.
    Inaccessible {
        /// Why the open failed.
        reason: DecryptionError,
    },
}

/// Registry record for one database.
pub struct DatabaseEntry {
    /// Descriptor the entry was loaded from.
    pub descriptor: DatabaseDescriptor,
    /// Open outcome.
    pub status: DatabaseStatus,
    tables: BTreeMap<LogicalRole, Vec<TableDescriptor>>,
    table_roles: HashMap<String, LogicalRole>,
    handle: Option<SharedHandle>,
}

impl std::fmt::Debug for DatabaseEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseEntry")
            .field("id", &self.descriptor.id)
            .field("status", &self.status)
            .field("tables", &self.tables)
            .finish()
    }
}

impl DatabaseEntry {
    fn accessible(
        descriptor: DatabaseDescriptor,
        classification: Classification,
        row_counts: &HashMap<String, u64>,
        handle: Box<dyn DatabaseHandle>,
    ) -> Self {
        let mut tables: BTreeMap<LogicalRole, Vec<TableDescriptor>> = BTreeMap::new();
        let mut table_roles = HashMap::new();

        for table in classification.tables {
            table_roles.insert(table.name.clone(), table.role);
            tables.entry(table.role).or_default().push(TableDescriptor {
                row_count: row_counts.get(&table.name).copied(),
                name: table.name,
                database_id: descriptor.id.clone(),
                role: table.role,
                shard_key: table.shard_key,
            });
        }
        for shards in tables.values_mut() {
            shards.sort_by(|a, b| {
                a.shard_key
                    .cmp(&b.shard_key)
                    .then_with(|| a.name.cmp(&b.name))
            });
        }

        Self {
            descriptor,
            status: DatabaseStatus::Accessible,
            tables,
            table_roles,
            handle: Some(Arc::new(tokio::sync::Mutex::new(handle))),
        }
    }

    fn inaccessible(descriptor: DatabaseDescriptor, reason: DecryptionError) -> Self {
        Self {
            descriptor,
            status: DatabaseStatus::Inaccessible { reason },
            tables: BTreeMap::new(),
            table_roles: HashMap::new(),
            handle: None,
        }
    }

    /// Database id.
    pub fn id(&self) -> &DatabaseId {
        &self.descriptor.id
    }

    /// Whether the database opened.
    pub fn is_accessible(&self) -> bool {
        matches!(self.status, DatabaseStatus::Accessible)
    }

    /// Tables under `role`, shard key ascending.
    pub fn tables(&self, role: LogicalRole) -> &[TableDescriptor] {
        self.tables.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of classified tables.
    pub fn table_count(&self) -> usize {
        self.table_roles.len()
    }

    /// Role assigned to `table`, if the database has it.
    pub fn role_of(&self, table: &str) -> Option<LogicalRole> {
        self.table_roles.get(table).copied()
    }

    /// Role suggested by the declared type label.
    pub fn declared_role(&self) -> Option<LogicalRole> {
        LogicalRole::from_declared_type(&self.descriptor.declared_type)
    }

    /// Serializable view without the handle or key.
    pub fn summary(&self) -> DatabaseSummary {
        DatabaseSummary {
            id: self.descriptor.id.clone(),
            path: self.descriptor.path.clone(),
            filename: self.descriptor.filename.clone(),
            declared_type: self.descriptor.declared_type.clone(),
            declared_role: self.declared_role(),
            size: self.descriptor.size,
            last_modified: self.descriptor.last_modified,
            status: self.status.clone(),
            table_count: self.table_count(),
            role_counts: self
                .tables
                .iter()
                .map(|(role, tables)| (*role, tables.len()))
                .collect(),
        }
    }

    pub(crate) fn handle(&self) -> RegistryResult<SharedHandle> {
        match (&self.handle, &self.status) {
            (Some(handle), _) => Ok(handle.clone()),
            (None, DatabaseStatus::Inaccessible { reason }) => Err(RegistryError::Inaccessible {
                database: self.descriptor.id.clone(),
                reason: reason.clone(),
            }),
            (None, DatabaseStatus::Accessible) => {
                Err(RegistryError::NotFound(self.descriptor.id.clone()))
            }
        }
    }
}

/// Serializable database listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSummary {
    /// Database id.
    pub id: DatabaseId,
    /// File path.
    pub path: PathBuf,
    /// File name.
    pub filename: String,
    /// Declared type label.
    pub declared_type: String,
    /// Role implied by the declared type.
    pub declared_role: Option<LogicalRole>,
    /// File size in bytes.
    pub size: Option<u64>,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
    /// Open outcome.
    pub status: DatabaseStatus,
    /// Number of classified tables.
    pub table_count: usize,
    /// Tables per role.
    pub role_counts: BTreeMap<LogicalRole, usize>,
}

/// One complete, immutable registry snapshot.
pub struct Generation {
    id: u64,
    databases: BTreeMap<DatabaseId, DatabaseEntry>,
    pub(crate) row_counts: DashMap<(DatabaseId, String), u64>,
    pub(crate) contacts: tokio::sync::OnceCell<Arc<Vec<ContactRecord>>>,
}

impl Generation {
    fn new(id: u64, entries: Vec<DatabaseEntry>) -> Self {
        let row_counts = DashMap::new();
        let mut databases = BTreeMap::new();
        for entry in entries {
            for tables in entry.tables.values() {
                for table in tables {
                    if let Some(count) = table.row_count {
                        row_counts.insert((entry.id().clone(), table.name.clone()), count);
                    }
                }
            }
            databases.insert(entry.id().clone(), entry);
        }
        Self {
            id,
            databases,
            row_counts,
            contacts: tokio::sync::OnceCell::new(),
        }
    }

    fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    /// Generation number; 0 before the first load.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Entry for `id`.
    pub fn database(&self, id: &DatabaseId) -> RegistryResult<&DatabaseEntry> {
        self.databases
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// All entries, ordered by database id.
    pub fn databases(&self) -> impl Iterator<Item = &DatabaseEntry> {
        self.databases.values()
    }

    /// Tables of one database under `role`, shard key ascending.
    pub fn tables_for(
        &self,
        id: &DatabaseId,
        role: LogicalRole,
    ) -> RegistryResult<Vec<TableDescriptor>> {
        let entry = self.database(id)?;
        Ok(entry
            .tables(role)
            .iter()
            .map(|table| self.with_cached_count(table))
            .collect())
    }

    /// Tables under `role` across every accessible database, ordered by
    /// database id then shard key.
    pub fn all_tables_for(&self, role: LogicalRole) -> Vec<(DatabaseId, TableDescriptor)> {
        self.databases
            .values()
            .filter(|entry| entry.is_accessible())
            .flat_map(|entry| {
                entry
                    .tables(role)
                    .iter()
                    .map(move |table| (entry.id().clone(), self.with_cached_count(table)))
            })
            .collect()
    }

    fn with_cached_count(&self, table: &TableDescriptor) -> TableDescriptor {
        let mut table = table.clone();
        if table.row_count.is_none() {
            table.row_count = self
                .row_counts
                .get(&(table.database_id.clone(), table.name.clone()))
                .map(|count| *count);
        }
        table
    }

    fn stats(&self, state: RegistryState) -> RegistryStats {
        aggregate(self.id, state, None, self.databases.values())
    }
}

/// Outcome of one load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReport {
    /// Generation now live.
    pub generation: u64,
    /// Every database in the manifest, ordered by id.
    pub databases: Vec<DatabaseSummary>,
    /// Wall-clock load time in milliseconds.
    pub elapsed_ms: u128,
}

impl LoadReport {
    /// Databases that opened.
    pub fn accessible(&self) -> usize {
        self.databases
            .iter()
            .filter(|db| db.status == DatabaseStatus::Accessible)
            .count()
    }

    /// Databases that failed to open.
    pub fn inaccessible(&self) -> usize {
        self.databases.len() - self.accessible()
    }
}

struct LoadProgress {
    ticket: u64,
    total: usize,
    completed: Vec<DatabaseEntry>,
}

#[derive(Debug, Clone, Copy)]
struct LoadOptions {
    probe_columns: bool,
    count_rows: bool,
}

/// Registry of loaded databases and their table mappings.
pub struct TableRegistry {
    gateway: Arc<dyn DecryptionGateway>,
    config: RegistryConfig,
    current: RwLock<Arc<Generation>>,
    state: RwLock<RegistryState>,
    ticket: AtomicU64,
    progress: Mutex<Option<LoadProgress>>,
}

impl TableRegistry {
    /// Empty registry opening databases through `gateway`.
    pub fn new(gateway: Arc<dyn DecryptionGateway>, config: RegistryConfig) -> Self {
        Self {
            gateway,
            config,
            current: RwLock::new(Arc::new(Generation::empty())),
            state: RwLock::new(RegistryState::Uninitialized),
            ticket: AtomicU64::new(0),
            progress: Mutex::new(None),
        }
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RegistryState {
        *read_lock(&self.state)
    }

    /// Pin the live generation.
    pub fn snapshot(&self) -> Arc<Generation> {
        read_lock(&self.current).clone()
    }

    /// Fail with [`RegistryError::Stale`] if `generation` is no longer live.
    pub fn ensure_current(&self, generation: &Generation) -> RegistryResult<()> {
        let current = read_lock(&self.current).id;
        if current == generation.id {
            Ok(())
        } else {
            Err(RegistryError::Stale {
                pinned: generation.id,
                current,
            })
        }
    }

    /// Load `descriptors` as the first generation.
    pub async fn initialize(
        &self,
        descriptors: Vec<DatabaseDescriptor>,
    ) -> RegistryResult<LoadReport> {
        self.load(descriptors).await
    }

    /// Replace the live generation with one built from `descriptors`.
    ///
    /// Queries keep being served from the previous generation until the new
    /// one is complete.
    pub async fn reload(&self, descriptors: Vec<DatabaseDescriptor>) -> RegistryResult<LoadReport> {
        self.load(descriptors).await
    }

    /// Drop every handle and return to `Uninitialized`. Cancels any load in
    /// flight.
    pub fn close(&self) {
        self.ticket.fetch_add(1, Ordering::SeqCst);
        *lock(&self.progress) = None;
        *write_lock(&self.current) = Arc::new(Generation::empty());
        *write_lock(&self.state) = RegistryState::Uninitialized;
        info!("Registry closed");
    }

    /// Tables of one database under `role`.
    pub fn tables_for(
        &self,
        id: &DatabaseId,
        role: LogicalRole,
    ) -> RegistryResult<Vec<TableDescriptor>> {
        self.snapshot().tables_for(id, role)
    }

    /// Tables under `role` across every accessible database.
    pub fn all_tables_for(&self, role: LogicalRole) -> Vec<(DatabaseId, TableDescriptor)> {
        self.snapshot().all_tables_for(role)
    }

    /// Summary of one database.
    pub fn database(&self, id: &DatabaseId) -> RegistryResult<DatabaseSummary> {
        Ok(self.snapshot().database(id)?.summary())
    }

    /// Summaries of every database, accessible or not.
    pub fn databases(&self) -> Vec<DatabaseSummary> {
        self.snapshot()
            .databases()
            .map(DatabaseEntry::summary)
            .collect()
    }

    /// Counts for the live generation, or partial counts while loading.
    pub fn stats(&self) -> RegistryStats {
        let state = self.state();
        if matches!(state, RegistryState::Initializing | RegistryState::Stale) {
            if let Some(progress) = lock(&self.progress).as_ref() {
                return aggregate(
                    progress.ticket,
                    state,
                    Some(progress.total),
                    progress.completed.iter(),
                );
            }
        }
        self.snapshot().stats(state)
    }

    async fn load(&self, descriptors: Vec<DatabaseDescriptor>) -> RegistryResult<LoadReport> {
        reject_duplicate_ids(&descriptors)?;
        let started = Instant::now();
        let ticket = self.ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let total = descriptors.len();

        let live = read_lock(&self.current).id;
        {
            let mut state = write_lock(&self.state);
            if *state == RegistryState::Ready {
                *state = RegistryState::Stale;
                info!("Generation {} marked stale by reload {}", live, ticket);
            }
        }
        *lock(&self.progress) = Some(LoadProgress {
            ticket,
            total,
            completed: Vec::with_capacity(total),
        });
        *write_lock(&self.state) = RegistryState::Initializing;
        info!("Loading generation {} with {} databases", ticket, total);

        let options = LoadOptions {
            probe_columns: self.config.probe_columns,
            count_rows: self.config.count_rows_on_load,
        };
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_opens.max(1)));
        let mut pending: Vec<Option<DatabaseDescriptor>> =
            descriptors.iter().cloned().map(Some).collect();
        let mut tasks = JoinSet::new();

        for (index, descriptor) in descriptors.into_iter().enumerate() {
            let gateway = self.gateway.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let permit = semaphore.acquire_owned().await.ok();
                let entry = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    load_database(gateway.as_ref(), descriptor, options)
                })
                .await;
                (index, entry)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if self.is_superseded(ticket) {
                tasks.abort_all();
                return Err(self.stale_error(ticket));
            }

            let entry = match joined {
                Ok((index, Ok(entry))) => {
                    pending[index] = None;
                    entry
                }
                Ok((index, Err(join_err))) => match pending[index].take() {
                    Some(descriptor) => DatabaseEntry::inaccessible(
                        descriptor,
                        DecryptionError::Io(format!("load task failed: {}", join_err)),
                    ),
                    None => continue,
                },
                Err(join_err) => {
                    warn!("Load task for generation {} aborted: {}", ticket, join_err);
                    continue;
                }
            };
            self.record_progress(ticket, entry);
        }

        // Anything still pending never reported back.
        for descriptor in pending.into_iter().flatten() {
            self.record_progress(
                ticket,
                DatabaseEntry::inaccessible(
                    descriptor,
                    DecryptionError::Io("load task did not complete".to_string()),
                ),
            );
        }

        let entries = {
            let mut progress = lock(&self.progress);
            if progress.as_ref().map(|p| p.ticket) != Some(ticket) {
                drop(progress);
                return Err(self.stale_error(ticket));
            }
            progress.take().map(|p| p.completed).unwrap_or_default()
        };

        let generation = Arc::new(Generation::new(ticket, entries));
        let databases: Vec<DatabaseSummary> =
            generation.databases().map(DatabaseEntry::summary).collect();
        {
            let mut current = write_lock(&self.current);
            if self.is_superseded(ticket) {
                return Err(self.stale_error(ticket));
            }
            *current = generation;
            *write_lock(&self.state) = RegistryState::Ready;
        }

        let report = LoadReport {
            generation: ticket,
            databases,
            elapsed_ms: started.elapsed().as_millis(),
        };
        info!(
            "Generation {} ready: {}/{} databases accessible in {} ms",
            ticket,
            report.accessible(),
            report.databases.len(),
            report.elapsed_ms
        );
        Ok(report)
    }

    fn record_progress(&self, ticket: u64, entry: DatabaseEntry) {
        let mut progress = lock(&self.progress);
        match progress.as_mut() {
            Some(p) if p.ticket == ticket => p.completed.push(entry),
            _ => debug!("Discarding result for superseded generation {}", ticket),
        }
    }

    fn is_superseded(&self, ticket: u64) -> bool {
        self.ticket.load(Ordering::SeqCst) != ticket
    }

    fn stale_error(&self, ticket: u64) -> RegistryError {
        info!("Load for generation {} superseded; results discarded", ticket);
        RegistryError::Stale {
            pinned: ticket,
            current: self.ticket.load(Ordering::SeqCst),
        }
    }
}

fn reject_duplicate_ids(descriptors: &[DatabaseDescriptor]) -> Result<(), ManifestError> {
    let mut seen = HashSet::with_capacity(descriptors.len());
    for descriptor in descriptors {
        if !seen.insert(&descriptor.id) {
            return Err(ManifestError::DuplicateDatabase {
                id: descriptor.id.clone(),
                path: descriptor.path.display().to_string(),
            });
        }
    }
    Ok(())
}

fn load_database(
    gateway: &dyn DecryptionGateway,
    descriptor: DatabaseDescriptor,
    options: LoadOptions,
) -> DatabaseEntry {
    let fallback = descriptor.clone();
    match catch_unwind(AssertUnwindSafe(|| open_and_classify(gateway, descriptor, options))) {
        Ok(entry) => entry,
        Err(_) => DatabaseEntry::inaccessible(
            fallback,
            DecryptionError::Io("database load panicked".to_string()),
        ),
    }
}

fn open_and_classify(
    gateway: &dyn DecryptionGateway,
    descriptor: DatabaseDescriptor,
    options: LoadOptions,
) -> DatabaseEntry {
    let handle = match gateway.open(&descriptor.path, &descriptor.key) {
        Ok(handle) => handle,
        Err(reason) => {
            warn!(
                "Database {} ({}) inaccessible: {}",
                descriptor.id, descriptor.filename, reason
            );
            return DatabaseEntry::inaccessible(descriptor, reason);
        }
    };

    let names = match handle.list_tables() {
        Ok(names) => names,
        Err(reason) => {
            warn!(
                "Database {} ({}) schema unreadable: {}",
                descriptor.id, descriptor.filename, reason
            );
            return DatabaseEntry::inaccessible(descriptor, reason);
        }
    };

    let classified = catch_unwind(AssertUnwindSafe(|| {
        if options.probe_columns {
            classify(&descriptor.id, &names, handle.as_ref())
        } else {
            classify(&descriptor.id, &names, &NoProbe)
        }
    }));
    let classification = match classified {
        Ok(classification) => classification,
        Err(_) => {
            warn!(
                "Classification of {} failed; all {} tables marked unknown",
                descriptor.id,
                names.len()
            );
            Classification::all_unknown(&names)
        }
    };

    let mut row_counts = HashMap::new();
    if options.count_rows {
        for table in &classification.tables {
            if table.role == LogicalRole::Unknown {
                continue;
            }
            match handle.count_rows(&table.name) {
                Ok(count) => {
                    row_counts.insert(table.name.clone(), count);
                }
                Err(e) => debug!("Row count failed for {}: {}", table.name, e),
            }
        }
    }

    info!(
        "Database {} ({}, {}) classified {} tables",
        descriptor.id,
        descriptor.filename,
        descriptor.declared_type,
        classification.tables.len()
    );
    DatabaseEntry::accessible(descriptor, classification, &row_counts, handle)
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
