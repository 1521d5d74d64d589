// src/lib.rs
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod meta;
mod midl;
mod transaction;
mod types;

pub mod backend;
pub mod config;
pub mod entry;
pub mod entry_index;
pub mod index_cfg;
pub mod index_write;
pub mod key;
pub mod metadata;
pub mod parent_index;
pub mod schema;
pub mod uniqueness;
pub mod value_metadata;

pub use constants::*;
pub use cursor::{Cursor, CursorFlags, CursorIterator, Pair};
pub use database::Database;
pub use env::Environment;
pub use error::{ldap_result, BackendError, BackendResult, Error, Result};
pub use midl::{IdlFlags, ID, IDL};
pub use transaction::Transaction;
pub use types::{CursorOp, EnvInfo, Stat};

pub use backend::{Backend, Filter};
pub use config::{BackendConfig, IndexDefinition};
pub use entry::{Attribute, Entry};
pub use entry_index::{EntryResolver, StoreResolver};
pub use index_cfg::{IndexAccess, IndexCfgHandle, IndexCfgRegistry, IndexConfig, IndexTypes, IndexingStatus};
pub use index_write::IndexOp;
pub use metadata::AttributeMetadata;
pub use schema::{AttributeDescriptor, Normalization, Schema, SchemaLookup};
pub use value_metadata::{ValueAttributeMetadata, ValueOpCode};

/// Render bytes for log output, truncated to `MAX_LOG_OUTPUT_LEN`
pub(crate) fn log_bytes(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(MAX_LOG_OUTPUT_LEN)];
    let mut out = String::from_utf8_lossy(shown).into_owned();
    if bytes.len() > MAX_LOG_OUTPUT_LEN {
        out.push_str("...");
    }
    out
}
