//! Index table writes.
//!
//! Every function here works inside the caller's write transaction and stops
//! at the first failure; aborting the transaction is up to the caller.

use log::{debug, error, trace};

use crate::constants::{ATTR_ATTR_META_DATA, ATTR_ATTR_VALUE_META_DATA, WriteFlags};
use crate::cursor::Cursor;
use crate::database::Database;
use crate::entry_index::EntryResolver;
use crate::error::{BackendError, BackendResult, Error};
use crate::index_cfg::{IndexAccess, IndexCfgRegistry, IndexTypes};
use crate::key::{
    attr_meta_key_prefix, encode_attr_meta_key, encode_entry_id, encode_forward_key, encode_reverse_key,
};
use crate::log_bytes;
use crate::midl::ID;
use crate::transaction::Transaction;
use crate::uniqueness::validate_uniqueness;
use crate::value_metadata::{get_attr_value_metadata, ValueAttributeMetadata};

/// Kind of index change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Create,
    Update,
    Delete,
}

/// Apply one key/value change to an index table
///
/// Creation in a unique index refuses an existing key. Deletion removes the
/// key alone when unique, otherwise only the exact pair.
pub fn update_key_value(
    db: &Database,
    txn: &mut Transaction<'_>,
    key: &[u8],
    value: &[u8],
    is_unique: bool,
    op: IndexOp,
) -> BackendResult<()> {
    trace!("{:?} key {} value {}", op, log_bytes(key), log_bytes(value));
    match op {
        IndexOp::Create => {
            let flags = if is_unique {
                WriteFlags::NOOVERWRITE
            } else {
                WriteFlags::empty()
            };
            db.put(txn, key, value, flags)?;
        }
        IndexOp::Update => db.put(txn, key, value, WriteFlags::empty())?,
        IndexOp::Delete => delete_key_value(db, txn, key, value, is_unique)?,
    }
    Ok(())
}

pub fn delete_key_value(
    db: &Database,
    txn: &mut Transaction<'_>,
    key: &[u8],
    value: &[u8],
    is_unique: bool,
) -> BackendResult<()> {
    let data = if is_unique { None } else { Some(value) };
    db.del(txn, key, data)?;
    Ok(())
}

/// Index every normalized value of one attribute of one entry
///
/// Values are checked for uniqueness one by one right before they are
/// written. Unindexed attributes are a no-op.
#[allow(clippy::too_many_arguments)]
pub fn update_indices_for_attribute(
    txn: &mut Transaction<'_>,
    registry: &IndexCfgRegistry,
    resolver: &dyn EntryResolver,
    entry_dn: &str,
    attr_type: &str,
    values: &[Vec<u8>],
    entry_id: ID,
    op: IndexOp,
) -> BackendResult<()> {
    let Some(cfg) = registry.try_acquire(attr_type, IndexAccess::Write) else {
        trace!("{} is not indexed", attr_type);
        return Ok(());
    };

    let db = cfg.db();
    let is_unique = cfg.global_unique();
    let types = cfg.index_types();
    let eid = encode_entry_id(entry_id);

    for value in values {
        let result = validate_uniqueness(txn, &cfg, resolver, value, entry_dn, op).and_then(|()| {
            if types.contains(IndexTypes::EQUALITY) {
                update_key_value(&db, txn, &encode_forward_key(value), &eid, is_unique, op)?;
            }
            if types.contains(IndexTypes::SUBSTR) {
                update_key_value(&db, txn, &encode_reverse_key(value), &eid, is_unique, op)?;
            }
            Ok(())
        });

        if let Err(err) = result {
            error!(
                "index {:?} failed: entry {} attribute {} value {}: {}",
                op,
                entry_id,
                attr_type,
                log_bytes(value),
                err
            );
            return Err(err);
        }
    }

    debug!("indexed {} value(s) of {} for entry {}", values.len(), attr_type, entry_id);
    Ok(())
}

/// Write the serialized metadata of one attribute
///
/// An update carrying no metadata leaves the stored record alone.
pub fn update_attr_metadata(
    txn: &mut Transaction<'_>,
    registry: &IndexCfgRegistry,
    attr_id: u16,
    metadata: &str,
    entry_id: ID,
    op: IndexOp,
) -> BackendResult<()> {
    if op == IndexOp::Update && metadata.is_empty() {
        return Ok(());
    }

    let cfg = registry.acquire(ATTR_ATTR_META_DATA, IndexAccess::Write)?;
    let key = encode_attr_meta_key(entry_id, attr_id);
    update_key_value(&cfg.db(), txn, &key, metadata.as_bytes(), cfg.global_unique(), op).map_err(|err| {
        error!(
            "attribute metadata {:?} failed: entry {} attribute id {}: {}",
            op, entry_id, attr_id, err
        );
        err
    })
}

/// Write value metadata records of one attribute
///
/// Before an update, records for the same value whose change is not newer
/// are dropped, so only the latest change per value is kept.
pub fn update_attr_value_metadata(
    txn: &mut Transaction<'_>,
    registry: &IndexCfgRegistry,
    entry_id: ID,
    attr_id: u16,
    op: IndexOp,
    records: &[ValueAttributeMetadata],
) -> BackendResult<()> {
    let cfg = registry.acquire(ATTR_ATTR_VALUE_META_DATA, IndexAccess::Write)?;
    let db = cfg.db();
    let key = encode_attr_meta_key(entry_id, attr_id);

    for record in records {
        if op == IndexOp::Update {
            let stored = get_attr_value_metadata(txn, registry, entry_id, attr_id)?;
            for obsolete in stored
                .iter()
                .filter(|old| old.same_value(record) && old.is_not_newer_than(record))
            {
                delete_key_value(&db, txn, &key, &obsolete.serialize()?, false)?;
            }
        }

        let bytes = record.serialize()?;
        match op {
            IndexOp::Delete => delete_key_value(&db, txn, &key, &bytes, false)?,
            _ => update_key_value(&db, txn, &key, &bytes, false, IndexOp::Create)?,
        }
    }
    Ok(())
}

/// Drop every value metadata record of one attribute
pub fn delete_all_attr_value_metadata(
    txn: &mut Transaction<'_>,
    registry: &IndexCfgRegistry,
    entry_id: ID,
    attr_id: u16,
) -> BackendResult<()> {
    let cfg = registry.acquire(ATTR_ATTR_VALUE_META_DATA, IndexAccess::Write)?;
    let key = encode_attr_meta_key(entry_id, attr_id);
    match cfg.db().del(txn, &key, None) {
        Ok(()) | Err(Error::NotFound) => Ok(()),
        Err(err) => Err(BackendError::from(err)),
    }
}

/// Drop every attribute and value metadata record of one entry
///
/// Returns the number of keys removed.
pub fn delete_entry_metadata(
    txn: &mut Transaction<'_>,
    registry: &IndexCfgRegistry,
    entry_id: ID,
) -> BackendResult<usize> {
    let prefix = attr_meta_key_prefix(entry_id);
    let mut removed = 0;

    for table in [ATTR_ATTR_META_DATA, ATTR_ATTR_VALUE_META_DATA] {
        let Some(cfg) = registry.try_acquire(table, IndexAccess::Write) else {
            continue;
        };
        let db = cfg.db();
        let keys = {
            let cursor = Cursor::new(txn, &db)?;
            let mut keys = Vec::new();
            let mut pair = cursor.set_range(&prefix)?;
            while let Some((key, _)) = pair {
                if !key.starts_with(&prefix) {
                    break;
                }
                keys.push(key.to_vec());
                pair = cursor.next_nodup()?;
            }
            keys
        };
        for key in &keys {
            db.del(txn, key, None)?;
        }
        removed += keys.len();
    }

    trace!("dropped {} metadata key(s) of entry {}", removed, entry_id);
    Ok(removed)
}
