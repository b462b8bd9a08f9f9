//! Core types, errors, and configuration for wxindex.
//!
//! This crate holds the vocabulary shared by the registry engine and the CLI:
//! logical table roles, database identifiers, shard keys, lifecycle states,
//! and the TOML-backed configuration.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use config::WxIndexConfig;
pub use error::{Error, Result};
pub use types::*;
