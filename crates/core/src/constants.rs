//! Application constants and configuration defaults.

/// Default SQLCipher compatibility level for WeChat macOS databases.
pub const DEFAULT_CIPHER_COMPATIBILITY: u32 = 3;

/// Default number of databases opened concurrently during a load.
pub const DEFAULT_MAX_CONCURRENT_OPENS: usize = 4;

/// Rows fetched per delegated read when scanning tables.
pub const DEFAULT_READ_BATCH_SIZE: usize = 1000;

/// Size of the SQLite file header in bytes.
pub const SQLITE_HEADER_SIZE: u64 = 100;

/// Length in bytes of the path digest used for database ids.
pub const DATABASE_ID_BYTES: usize = 8;

/// Declared type label used when a path carries no usable directory name.
pub const UNKNOWN_DECLARED_TYPE: &str = "unknown";

/// Default output file for chat exports.
pub const DEFAULT_EXPORT_PATH: &str = "wechat_chat_export.json";
