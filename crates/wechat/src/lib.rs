//! Table mapping registry for encrypted WeChat databases.
//!
//! This crate provides functionality for:
//! - Validating a key manifest and deriving database descriptors
//! - Opening SQLCipher databases through a pluggable decryption gateway
//! - Classifying physical tables into logical roles and shards
//! - Serving role lookups, row reads and contact search from atomically
//!   swapped registry generations
//! - Watching the keys file for changes

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod chat;
pub mod classifier;
pub mod contacts;
pub mod error;
pub mod gateway;
pub mod manifest;
pub mod query;
pub mod registry;
pub mod sqlcipher;
pub mod stats;
pub mod watch;

pub use chat::ChatRecord;
pub use classifier::{classify, split_shard, Classification};
pub use contacts::{search_contacts, ContactRecord, ContactRowParser, WeChatContactParser};
pub use error::{DecryptionError, ManifestError, RegistryError, RegistryResult};
pub use gateway::{DatabaseHandle, DecryptionGateway, RowPage, RowRange};
pub use manifest::{descriptors_from_manifest, DatabaseDescriptor, ManifestEntry};
pub use query::{QueryFacade, RoleRow};
pub use registry::{
    DatabaseStatus, DatabaseSummary, Generation, LoadReport, TableDescriptor, TableRegistry,
};
pub use sqlcipher::SqlCipherGateway;
pub use stats::RegistryStats;
pub use watch::{KeysWatcher, KeysWatcherConfig, WatchEvent};
