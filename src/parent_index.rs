//! Containment index: parent entry id -> child entry ids.

use log::trace;

use crate::constants::ATTR_PARENT_ID;
use crate::cursor::Cursor;
use crate::entry_index::EntryResolver;
use crate::error::{BackendResult, Error};
use crate::index_cfg::{IndexAccess, IndexCfgRegistry};
use crate::index_write::{update_key_value, IndexOp};
use crate::key::{decode_entry_id, encode_entry_id};
use crate::midl::{ID, IDL};
use crate::schema::split_rdns;
use crate::transaction::Transaction;

/// DN of the immediate parent; top-level entries have the empty DN
pub fn parent_dn(dn: &str) -> String {
    let rdns = split_rdns(dn);
    rdns.get(1..)
        .map(|rest| rest.iter().map(|rdn| rdn.trim()).collect::<Vec<_>>().join(","))
        .unwrap_or_default()
}

fn resolve_parent(
    txn: &Transaction<'_>,
    resolver: &dyn EntryResolver,
    child_dn: &str,
) -> BackendResult<ID> {
    let parent = parent_dn(child_dn);
    let parent_id = resolver.dn_to_entry_id(txn, &parent)?;
    trace!("parent of {} is {} ({})", child_dn, parent, parent_id);
    Ok(parent_id)
}

pub fn create_parent_index(
    txn: &mut Transaction<'_>,
    registry: &IndexCfgRegistry,
    resolver: &dyn EntryResolver,
    child_dn: &str,
    child_id: ID,
) -> BackendResult<()> {
    let parent_id = resolve_parent(txn, resolver, child_dn)?;
    let cfg = registry.acquire(ATTR_PARENT_ID, IndexAccess::Write)?;
    update_key_value(
        &cfg.db(),
        txn,
        &encode_entry_id(parent_id),
        &encode_entry_id(child_id),
        false,
        IndexOp::Create,
    )
}

pub fn delete_parent_index(
    txn: &mut Transaction<'_>,
    registry: &IndexCfgRegistry,
    resolver: &dyn EntryResolver,
    child_dn: &str,
    child_id: ID,
) -> BackendResult<()> {
    let parent_id = resolve_parent(txn, resolver, child_dn)?;
    let cfg = registry.acquire(ATTR_PARENT_ID, IndexAccess::Write)?;
    update_key_value(
        &cfg.db(),
        txn,
        &encode_entry_id(parent_id),
        &encode_entry_id(child_id),
        false,
        IndexOp::Delete,
    )
}

/// True when no entry names `entry_id` as its parent
pub fn is_leaf(txn: &Transaction<'_>, registry: &IndexCfgRegistry, entry_id: ID) -> BackendResult<bool> {
    let cfg = registry.acquire(ATTR_PARENT_ID, IndexAccess::Read)?;
    Ok(cfg.db().get(txn, &encode_entry_id(entry_id))?.is_none())
}

/// Immediate children of `parent_id`
pub fn children(txn: &Transaction<'_>, registry: &IndexCfgRegistry, parent_id: ID) -> BackendResult<IDL> {
    let cfg = registry.acquire(ATTR_PARENT_ID, IndexAccess::Read)?;
    let cursor = Cursor::new(txn, &cfg.db())?;

    let mut idl = IDL::new();
    for pair in cursor.iter_dup(&encode_entry_id(parent_id))? {
        let (_, data) = pair?;
        idl.append(decode_entry_id(data).ok_or(Error::Corrupted)?);
    }
    idl.sort();
    Ok(idl)
}
