//! CLI command definitions for wxindex.
//!
//! Every command loads the databases listed in a `.keys` file, builds the
//! table registry, and answers from it.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use wxindex_core::LogicalRole;

/// Main CLI application.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Logging verbosity
    #[arg(short, long, default_value_t = 0, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, env = "WXINDEX_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load every database and print registry statistics
    Stats(StatsArgs),

    /// List classified tables
    Tables(TablesArgs),

    /// List databases with their open status
    Databases(DatabasesArgs),

    /// Search contacts by display name
    Contacts(ContactsArgs),

    /// Read rows from a table or run a SELECT statement
    Query(QueryArgs),

    /// Export every chat message to JSON
    Export(ExportArgs),

    /// Reload whenever the keys file changes
    Watch(WatchArgs),
}

/// Keys file shared by every command.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Path to the .keys file
    #[arg(env = "WXINDEX_KEYS_FILE")]
    pub keys: PathBuf,
}

/// Stats arguments.
#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Keys file to load
    #[command(flatten)]
    pub source: SourceArgs,

    /// Output format
    #[arg(short, long, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Table listing arguments.
#[derive(Args, Debug)]
pub struct TablesArgs {
    /// Keys file to load
    #[command(flatten)]
    pub source: SourceArgs,

    /// Only tables with this role (chat, contact, session, media, unknown)
    #[arg(short, long)]
    pub role: Option<LogicalRole>,

    /// Only tables of this database id
    #[arg(long)]
    pub db: Option<String>,

    /// Output format
    #[arg(short, long, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Database listing arguments.
#[derive(Args, Debug)]
pub struct DatabasesArgs {
    /// Keys file to load
    #[command(flatten)]
    pub source: SourceArgs,

    /// Also list per-role table counts
    #[arg(long, default_value_t = false)]
    pub show_tables: bool,

    /// Output format
    #[arg(short, long, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Contact search arguments.
#[derive(Args, Debug)]
pub struct ContactsArgs {
    /// Keys file to load
    #[command(flatten)]
    pub source: SourceArgs,

    /// Display name filter; empty lists everyone
    #[arg(short, long, default_value = "")]
    pub query: String,

    /// Limit results
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Output format
    #[arg(short, long, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Row query arguments.
#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Keys file to load
    #[command(flatten)]
    pub source: SourceArgs,

    /// Database id
    #[arg(long)]
    pub db: String,

    /// Table to read
    #[arg(short, long, conflicts_with = "sql", required_unless_present = "sql")]
    pub table: Option<String>,

    /// SELECT statement to run
    #[arg(long)]
    pub sql: Option<String>,

    /// Rows to read
    #[arg(short, long, default_value_t = 20)]
    pub limit: u64,

    /// Rows to skip
    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    /// Output format
    #[arg(short, long, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Chat export arguments.
#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Keys file to load
    #[command(flatten)]
    pub source: SourceArgs,

    /// Output file; defaults to the configured export path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Rows per read
    #[arg(long)]
    pub batch_size: Option<usize>,
}

/// Watch arguments.
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Keys file to load
    #[command(flatten)]
    pub source: SourceArgs,

    /// Quiet period before reloading, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub debounce_ms: u64,

    /// Output format
    #[arg(short, long, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text
    Text,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_role_parses_aliases() {
        let cli = Cli::parse_from(["wxindex", "tables", "my.keys", "--role", "contact"]);
        match cli.command {
            Commands::Tables(args) => {
                assert_eq!(args.role, Some(LogicalRole::ContactInfo));
                assert_eq!(args.source.keys, PathBuf::from("my.keys"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_query_requires_table_or_sql() {
        let missing = Cli::try_parse_from(["wxindex", "query", "my.keys", "--db", "abc"]);
        assert!(missing.is_err());

        let both = Cli::try_parse_from([
            "wxindex", "query", "my.keys", "--db", "abc", "--table", "t", "--sql", "SELECT 1",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn test_verbosity_counts() {
        let cli = Cli::parse_from(["wxindex", "-vv", "stats", "my.keys"]);
        assert_eq!(cli.verbose, 2);
    }
}
