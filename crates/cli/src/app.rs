//! CLI application entry point and configuration.
//!
//! This module provides the main CLI application logic, including argument parsing,
//! configuration loading, and command dispatch.

use crate::commands::{
    Cli, Commands, ContactsArgs, DatabasesArgs, ExportArgs, OutputFormat, QueryArgs, SourceArgs,
    StatsArgs, TablesArgs, WatchArgs,
};
use crate::error::{CliError, Result};
use crate::keys::load_keys_file;
use clap::Parser;
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wxindex_core::config::LogLevel;
use wxindex_core::{DatabaseId, LogicalRole, WxIndexConfig};
use wxindex_wechat::{
    descriptors_from_manifest, ChatRecord, DatabaseDescriptor, DatabaseStatus, DatabaseSummary,
    KeysWatcher, KeysWatcherConfig, LoadReport, QueryFacade, RegistryStats, RowPage, RowRange,
    SqlCipherGateway, TableDescriptor, TableRegistry, WatchEvent,
};

/// Main CLI application.
#[derive(Debug)]
pub struct App {
    /// Loaded configuration.
    pub config: WxIndexConfig,
    /// File the configuration came from, if any.
    pub config_path: Option<PathBuf>,
    /// Parsed CLI arguments.
    pub cli: Cli,
}

impl App {
    /// Create a new application instance from command line arguments.
    pub fn new() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    /// Create an application instance from already parsed arguments.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let (config, config_path) = Self::load_config(&cli)?;
        Ok(Self {
            config,
            config_path,
            cli,
        })
    }

    /// Load configuration from the given file, or the default location.
    fn load_config(cli: &Cli) -> Result<(WxIndexConfig, Option<PathBuf>)> {
        if let Some(config_path) = &cli.config {
            if !config_path.exists() {
                return Err(CliError::Argument(format!(
                    "configuration file not found: {}",
                    config_path.display()
                )));
            }
            let config = WxIndexConfig::load(config_path)?;
            return Ok((config, Some(config_path.clone())));
        }

        match WxIndexConfig::default_path() {
            Ok(path) if path.exists() => {
                let config = WxIndexConfig::load(&path)?;
                Ok((config, Some(path)))
            }
            _ => Ok((WxIndexConfig::default(), None)),
        }
    }

    /// Run the application.
    pub fn run(self) -> Result<()> {
        self.setup_logging();
        if let Some(path) = &self.config_path {
            info!("Using configuration {}", path.display());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| CliError::Internal(format!("failed to build runtime: {}", e)))?;

        runtime.block_on(async {
            match &self.cli.command {
                Commands::Stats(args) => self.handle_stats(args).await,
                Commands::Tables(args) => self.handle_tables(args).await,
                Commands::Databases(args) => self.handle_databases(args).await,
                Commands::Contacts(args) => self.handle_contacts(args).await,
                Commands::Query(args) => self.handle_query(args).await,
                Commands::Export(args) => self.handle_export(args).await,
                Commands::Watch(args) => self.handle_watch(args).await,
            }
        })
    }

    /// Set up logging based on verbosity level. `RUST_LOG` wins when set.
    fn setup_logging(&self) {
        let level = match self.cli.verbose {
            0 => self.config.logging.level,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(self.config.logging.with_target)
            .with_writer(std::io::stderr)
            .try_init()
            .ok(); // Ignore errors if a subscriber is already installed
    }

    fn new_registry(&self) -> Arc<TableRegistry> {
        let gateway = SqlCipherGateway::new(self.config.registry.cipher_compatibility);
        Arc::new(TableRegistry::new(
            Arc::new(gateway),
            self.config.registry.clone(),
        ))
    }

    async fn open(&self, source: &SourceArgs) -> Result<(QueryFacade, LoadReport)> {
        let registry = self.new_registry();
        let descriptors = read_descriptors(&source.keys)?;
        let report = registry.initialize(descriptors).await?;
        Ok((QueryFacade::new(registry), report))
    }

    async fn handle_stats(&self, args: &StatsArgs) -> Result<()> {
        let (facade, _) = self.open(&args.source).await?;
        print_stats(&facade.stats(), args.format)
    }

    async fn handle_tables(&self, args: &TablesArgs) -> Result<()> {
        let (facade, _) = self.open(&args.source).await?;
        let roles: Vec<LogicalRole> = match args.role {
            Some(role) => vec![role],
            None => LogicalRole::ALL.to_vec(),
        };

        let mut tables: Vec<TableDescriptor> = Vec::new();
        for role in roles {
            match &args.db {
                Some(db) => tables.extend(facade.tables_for(&DatabaseId::from(db.as_str()), role)?),
                None => tables.extend(
                    facade
                        .all_tables_for(role)
                        .into_iter()
                        .map(|(_, table)| table),
                ),
            }
        }

        print_tables(&tables, args.format)
    }

    async fn handle_databases(&self, args: &DatabasesArgs) -> Result<()> {
        let (_, report) = self.open(&args.source).await?;
        print_databases(&report.databases, args.show_tables, args.format)
    }

    async fn handle_contacts(&self, args: &ContactsArgs) -> Result<()> {
        let (facade, _) = self.open(&args.source).await?;
        let mut contacts = facade.search_contacts(&args.query).await?;
        if let Some(limit) = args.limit {
            contacts.truncate(limit);
        }

        match args.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&contacts)?),
            OutputFormat::Csv => {
                println!("username,display_name,nickname,remark,alias,database_id");
                for c in &contacts {
                    println!(
                        "{},{},{},{},{},{}",
                        csv_escape(&c.username),
                        csv_escape(&c.display_name),
                        csv_escape(c.nickname.as_deref().unwrap_or_default()),
                        csv_escape(c.remark.as_deref().unwrap_or_default()),
                        csv_escape(c.alias.as_deref().unwrap_or_default()),
                        c.database_id
                    );
                }
            }
            OutputFormat::Text => {
                for c in &contacts {
                    println!("{}\t{}", c.username, c.display_name);
                }
                println!("{} contacts", contacts.len());
            }
        }
        Ok(())
    }

    async fn handle_query(&self, args: &QueryArgs) -> Result<()> {
        let (facade, _) = self.open(&args.source).await?;
        let id = DatabaseId::from(args.db.as_str());

        let page = match (&args.table, &args.sql) {
            (_, Some(sql)) => {
                let sql = validate_select_sql(sql)?;
                facade.execute_query(&id, &sql).await?
            }
            (Some(table), None) => {
                facade
                    .read_rows(&id, table, RowRange::new(args.offset, args.limit))
                    .await?
            }
            (None, None) => {
                return Err(CliError::Argument(
                    "either --table or --sql is required".to_string(),
                ))
            }
        };

        print_rows(&page, args.format)
    }

    async fn handle_export(&self, args: &ExportArgs) -> Result<()> {
        let (facade, report) = self.open(&args.source).await?;
        let batch_size = args
            .batch_size
            .unwrap_or(self.config.registry.read_batch_size);
        let output = args
            .output
            .clone()
            .unwrap_or_else(|| self.config.export.output_path.clone());

        let mut messages: Vec<ChatRecord> = Vec::new();
        let mut records = Box::pin(facade.chat_records(batch_size));
        while let Some(record) = records.next().await {
            messages.push(record?);
            if messages.len() % 10_000 == 0 {
                info!("Extracted {} messages...", messages.len());
            }
        }

        let export = ChatExport {
            metadata: ExportMetadata {
                extracted_at: chrono::Utc::now(),
                total_messages: messages.len(),
                total_databases: report.databases.len(),
                source_keys_file: args.source.keys.display().to_string(),
            },
            messages,
        };
        write_export(&output, &export)?;

        println!(
            "exported {} messages from {} databases to {}",
            export.metadata.total_messages,
            report.accessible(),
            output.display()
        );
        Ok(())
    }

    async fn handle_watch(&self, args: &WatchArgs) -> Result<()> {
        let registry = self.new_registry();
        let facade = QueryFacade::new(registry.clone());
        registry
            .initialize(read_descriptors(&args.source.keys)?)
            .await?;
        print_stats(&facade.stats(), args.format)?;

        let mut watcher = KeysWatcher::start(KeysWatcherConfig {
            debounce_ms: args.debounce_ms,
            ..KeysWatcherConfig::new(&args.source.keys)
        })?;
        println!("watching {} (ctrl-c to stop)", watcher.path().display());

        loop {
            tokio::select! {
                event = watcher.next_event() => match event {
                    Some(WatchEvent::Changed(path)) => {
                        info!("Keys file changed: {}", path.display());
                        match read_descriptors(&path) {
                            Ok(descriptors) => {
                                registry.reload(descriptors).await?;
                                print_stats(&facade.stats(), args.format)?;
                            }
                            Err(e) => warn!("Keeping current generation: {}", e),
                        }
                    }
                    Some(WatchEvent::Removed(path)) => {
                        warn!("Keys file removed: {}; keeping current generation", path.display());
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        watcher.stop()?;
        registry.close();
        Ok(())
    }
}

fn read_descriptors(keys: &Path) -> Result<Vec<DatabaseDescriptor>> {
    let entries = load_keys_file(keys)?;
    Ok(descriptors_from_manifest(&entries)?)
}

#[derive(Debug, Serialize)]
struct ExportMetadata {
    extracted_at: chrono::DateTime<chrono::Utc>,
    total_messages: usize,
    total_databases: usize,
    source_keys_file: String,
}

#[derive(Debug, Serialize)]
struct ChatExport {
    metadata: ExportMetadata,
    messages: Vec<ChatRecord>,
}

fn write_export(path: &Path, export: &ChatExport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), export)?;

    let size = std::fs::metadata(path)?.len();
    info!(
        "Export written to {} ({:.2} MB)",
        path.display(),
        size as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

fn print_stats(stats: &RegistryStats, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(stats)?),
        OutputFormat::Csv => {
            println!("generation,state,total_databases,accessible_databases,total_tables");
            println!(
                "{},{},{},{},{}",
                stats.generation,
                stats.state,
                stats.total_databases,
                stats.accessible_databases,
                stats.total_tables
            );
        }
        OutputFormat::Text => {
            println!("generation: {} ({})", stats.generation, stats.state);
            println!(
                "databases: {}/{} accessible ({:.1}%)",
                stats.accessible_databases,
                stats.total_databases,
                stats.accessibility_rate() * 100.0
            );
            println!("tables: {}", stats.total_tables);
            for (role, count) in &stats.per_role_table_counts {
                println!("  {:<8} {}", role, count);
            }
            if !stats.per_type_counts.is_empty() {
                println!("database types:");
                for (label, count) in &stats.per_type_counts {
                    println!("  {:<12} {}", label, count);
                }
            }
        }
    }
    Ok(())
}

fn print_tables(tables: &[TableDescriptor], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(tables)?),
        OutputFormat::Csv => {
            println!("database_id,table,role,shard_key,row_count");
            for t in tables {
                println!(
                    "{},{},{},{},{}",
                    t.database_id,
                    csv_escape(&t.name),
                    t.role,
                    csv_escape(&t.shard_key.as_ref().map(|k| k.to_string()).unwrap_or_default()),
                    t.row_count.map(|n| n.to_string()).unwrap_or_default()
                );
            }
        }
        OutputFormat::Text => {
            for t in tables {
                let shard = t
                    .shard_key
                    .as_ref()
                    .map(|k| format!(" [{}]", k))
                    .unwrap_or_default();
                println!("{}  {:<8} {}{}", t.database_id, t.role, t.name, shard);
            }
            println!("{} tables", tables.len());
        }
    }
    Ok(())
}

fn print_databases(
    databases: &[DatabaseSummary],
    show_tables: bool,
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(databases)?),
        OutputFormat::Csv => {
            println!("id,filename,declared_type,size_bytes,status,table_count,path");
            for db in databases {
                println!(
                    "{},{},{},{},{},{},{}",
                    db.id,
                    csv_escape(&db.filename),
                    csv_escape(&db.declared_type),
                    db.size.map(|n| n.to_string()).unwrap_or_default(),
                    csv_escape(&status_label(&db.status)),
                    db.table_count,
                    csv_escape(&db.path.display().to_string())
                );
            }
        }
        OutputFormat::Text => {
            for db in databases {
                println!(
                    "{}  {:<10} {} ({})",
                    db.id,
                    db.declared_type,
                    db.filename,
                    status_label(&db.status)
                );
                if let Some(size) = db.size {
                    println!("    size: {} bytes", size);
                }
                if show_tables {
                    for (role, count) in &db.role_counts {
                        println!("    {:<8} {}", role, count);
                    }
                }
            }
        }
    }
    Ok(())
}

fn status_label(status: &DatabaseStatus) -> String {
    match status {
        DatabaseStatus::Accessible => "accessible".to_string(),
        DatabaseStatus::Inaccessible { reason } => format!("inaccessible: {}", reason),
    }
}

fn print_rows(page: &RowPage, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let objects: Vec<serde_json::Value> = page
                .rows
                .iter()
                .map(|row| {
                    let obj: serde_json::Map<String, serde_json::Value> = row
                        .iter()
                        .enumerate()
                        .map(|(idx, value)| (column_name(&page.columns, idx), value.clone()))
                        .collect();
                    serde_json::Value::Object(obj)
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&objects)?);
        }
        OutputFormat::Csv => {
            println!(
                "{}",
                page.columns
                    .iter()
                    .map(|h| csv_escape(h))
                    .collect::<Vec<_>>()
                    .join(",")
            );
            for row in &page.rows {
                println!(
                    "{}",
                    row.iter()
                        .map(|v| csv_escape(&value_to_string(v)))
                        .collect::<Vec<_>>()
                        .join(",")
                );
            }
        }
        OutputFormat::Text => {
            println!("{}", page.columns.join("\t"));
            for row in &page.rows {
                println!(
                    "{}",
                    row.iter().map(value_to_string).collect::<Vec<_>>().join("\t")
                );
            }
            println!("{} rows", page.len());
        }
    }
    Ok(())
}

fn column_name(columns: &[String], idx: usize) -> String {
    columns
        .get(idx)
        .cloned()
        .unwrap_or_else(|| format!("col_{}", idx + 1))
}

fn validate_select_sql(raw_sql: &str) -> Result<String> {
    let sql = raw_sql.trim();
    if sql.is_empty() {
        return Err(CliError::Argument("sql cannot be empty".to_string()));
    }

    let upper = sql.to_ascii_uppercase();
    if !upper.starts_with("SELECT") && !upper.starts_with("WITH") {
        return Err(CliError::Argument(
            "only SELECT statements are allowed".to_string(),
        ));
    }

    let trimmed_no_tail = sql.trim_end_matches(';').trim_end();
    if trimmed_no_tail.contains(';') {
        return Err(CliError::Argument(
            "multiple SQL statements are not allowed".to_string(),
        ));
    }

    Ok(trimmed_no_tail.to_string())
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn csv_escape(v: &str) -> String {
    let escaped = v.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Parse arguments and run the selected command.
pub fn run() -> Result<()> {
    let app = App::new()?;
    app.run()
}
