//! Primary entry table and DN / GUID to entry id resolution.

use log::{debug, trace};

use crate::constants::{ATTR_DN, ATTR_OBJECT_GUID, DSE_ROOT_ENTRY_ID, WriteFlags};
use crate::database::Database;
use crate::entry::Entry;
use crate::error::{BackendError, BackendResult, Error};
use crate::index_cfg::{IndexAccess, IndexCfgRegistry};
use crate::key::{decode_entry_id, encode_entry_id, encode_forward_key};
use crate::log_bytes;
use crate::midl::ID;
use crate::schema::normalize_dn;
use crate::transaction::Transaction;

/// DN resolution used by uniqueness checks and containment indexing
pub trait EntryResolver {
    fn dn_to_entry_id(&self, txn: &Transaction<'_>, dn: &str) -> BackendResult<ID>;

    fn entry_id_to_dn(&self, txn: &Transaction<'_>, entry_id: ID) -> BackendResult<String>;
}

/// Store an encoded entry
///
/// Creation refuses to overwrite an existing entry id.
pub fn put_entry(
    txn: &mut Transaction<'_>,
    entry_db: &Database,
    entry_id: ID,
    encoded: &[u8],
    is_create: bool,
) -> BackendResult<()> {
    let flags = if is_create {
        WriteFlags::NOOVERWRITE
    } else {
        WriteFlags::empty()
    };
    trace!("put entry {} ({} bytes)", entry_id, encoded.len());
    entry_db.put(txn, &encode_entry_id(entry_id), encoded, flags)?;
    Ok(())
}

pub fn delete_entry(txn: &mut Transaction<'_>, entry_db: &Database, entry_id: ID) -> BackendResult<()> {
    match entry_db.del(txn, &encode_entry_id(entry_id), None) {
        Ok(()) => Ok(()),
        Err(Error::NotFound) => Err(BackendError::EntryNotFound(format!("entry id {}", entry_id))),
        Err(err) => Err(err.into()),
    }
}

pub fn get_entry(txn: &Transaction<'_>, entry_db: &Database, entry_id: ID) -> BackendResult<Entry> {
    let bytes = entry_db
        .get(txn, &encode_entry_id(entry_id))?
        .ok_or_else(|| BackendError::EntryNotFound(format!("entry id {}", entry_id)))?;
    Entry::decode(bytes)
}

pub fn entry_id_to_dn(txn: &Transaction<'_>, entry_db: &Database, entry_id: ID) -> BackendResult<String> {
    let bytes = entry_db
        .get(txn, &encode_entry_id(entry_id))?
        .ok_or_else(|| BackendError::EntryNotFound(format!("entry id {}", entry_id)))?;
    let (_, dn) = Entry::decode_dn(bytes)?;
    Ok(dn)
}

/// Look up a DN in the entryDN index; the empty DN is the root entry
pub fn dn_to_entry_id(txn: &Transaction<'_>, registry: &IndexCfgRegistry, dn: &str) -> BackendResult<ID> {
    let normalized = normalize_dn(dn);
    if normalized.is_empty() {
        return Ok(DSE_ROOT_ENTRY_ID);
    }
    lookup_unique(txn, registry, ATTR_DN, normalized.as_bytes())
        .map_err(|err| not_found_as_entry(err, dn))
}

pub fn object_guid_to_entry_id(
    txn: &Transaction<'_>,
    registry: &IndexCfgRegistry,
    guid: &str,
) -> BackendResult<ID> {
    let normalized = guid.trim().to_ascii_lowercase();
    lookup_unique(txn, registry, ATTR_OBJECT_GUID, normalized.as_bytes())
        .map_err(|err| not_found_as_entry(err, guid))
}

fn not_found_as_entry(err: BackendError, name: &str) -> BackendError {
    match err {
        BackendError::Storage(Error::NotFound) => BackendError::EntryNotFound(name.to_string()),
        other => other,
    }
}

fn lookup_unique(
    txn: &Transaction<'_>,
    registry: &IndexCfgRegistry,
    attr: &str,
    normalized: &[u8],
) -> BackendResult<ID> {
    let cfg = registry.acquire(attr, IndexAccess::Read)?;
    let key = encode_forward_key(normalized);
    let raw = cfg.db().get(txn, &key)?.ok_or(Error::NotFound)?;
    let entry_id = decode_entry_id(raw).ok_or(Error::Corrupted)?;
    debug!("{} {} -> entry {}", attr, log_bytes(normalized), entry_id);
    Ok(entry_id)
}

/// Resolver backed by the entry table and the entryDN index
#[derive(Debug, Clone, Copy)]
pub struct StoreResolver<'r> {
    registry: &'r IndexCfgRegistry,
    entry_db: Database,
}

impl<'r> StoreResolver<'r> {
    pub fn new(registry: &'r IndexCfgRegistry, entry_db: Database) -> Self {
        StoreResolver { registry, entry_db }
    }
}

impl EntryResolver for StoreResolver<'_> {
    fn dn_to_entry_id(&self, txn: &Transaction<'_>, dn: &str) -> BackendResult<ID> {
        dn_to_entry_id(txn, self.registry, dn)
    }

    fn entry_id_to_dn(&self, txn: &Transaction<'_>, entry_id: ID) -> BackendResult<String> {
        entry_id_to_dn(txn, &self.entry_db, entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexDefinition;
    use crate::constants::{DbFlags, EnvFlags};
    use crate::env::Environment;
    use crate::index_cfg::{IndexConfig, IndexTypes, IndexingStatus};
    use tempfile::TempDir;

    #[test]
    fn test_put_get_delete_entry() {
        let dir = TempDir::new().unwrap();
        let env = Environment::new().unwrap().open(dir.path(), EnvFlags::NOSYNC).unwrap();
        let mut txn = env.begin_txn().unwrap();
        let entry_db = Database::create(&mut txn, "entryblob", DbFlags::CREATE).unwrap();

        let mut entry = Entry::new("cn=a,dc=x").with_attribute("cn", &[b"a"]);
        entry.eid = 5;
        let bytes = entry.encode().unwrap();

        put_entry(&mut txn, &entry_db, 5, &bytes, true).unwrap();
        assert_eq!(
            put_entry(&mut txn, &entry_db, 5, &bytes, true),
            Err(BackendError::Storage(Error::KeyExist))
        );
        put_entry(&mut txn, &entry_db, 5, &bytes, false).unwrap();

        assert_eq!(get_entry(&txn, &entry_db, 5).unwrap(), entry);
        assert_eq!(entry_id_to_dn(&txn, &entry_db, 5).unwrap(), "cn=a,dc=x");

        delete_entry(&mut txn, &entry_db, 5).unwrap();
        assert!(matches!(
            delete_entry(&mut txn, &entry_db, 5),
            Err(BackendError::EntryNotFound(_))
        ));
        assert!(get_entry(&txn, &entry_db, 5).unwrap_err().is_not_found());
    }

    #[test]
    fn test_dn_resolution() {
        let dir = TempDir::new().unwrap();
        let env = Environment::new().unwrap().open(dir.path(), EnvFlags::NOSYNC).unwrap();
        let mut txn = env.begin_txn().unwrap();
        let def = IndexDefinition::new(ATTR_DN, IndexTypes::EQUALITY).with_global_unique(true);
        let dn_db = Database::create(&mut txn, &def.table_name(), DbFlags::CREATE).unwrap();
        let registry = IndexCfgRegistry::new();
        registry.register(IndexConfig::new(&def, dn_db, IndexingStatus::Ready));

        dn_db
            .put(&mut txn, &encode_forward_key(b"cn=a,dc=x"), &encode_entry_id(9), WriteFlags::empty())
            .unwrap();

        assert_eq!(dn_to_entry_id(&txn, &registry, "").unwrap(), DSE_ROOT_ENTRY_ID);
        assert_eq!(dn_to_entry_id(&txn, &registry, "CN=A, DC=X").unwrap(), 9);
        assert!(matches!(
            dn_to_entry_id(&txn, &registry, "cn=b,dc=x"),
            Err(BackendError::EntryNotFound(_))
        ));
        // objectGUID is not indexed in this registry
        assert!(matches!(
            object_guid_to_entry_id(&txn, &registry, "abc"),
            Err(BackendError::NotFound(_))
        ));
    }
}
