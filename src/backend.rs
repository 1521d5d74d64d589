//! Directory backend: entries, their indices and their metadata over one
//! storage environment.
//!
//! Every mutating operation runs inside a write transaction supplied by the
//! caller. A failed operation leaves partial writes in that transaction, so
//! the caller must drop or abort it rather than commit.

use log::{debug, info, warn};

use crate::config::{BackendConfig, IndexDefinition};
use crate::constants::{
    DbFlags, EnvFlags, WriteFlags, ATTR_DN, DSE_ROOT_ENTRY_ID, ENTRY_DB_NAME, PERSISTED_DSE_ROOT_DN,
};
use crate::cursor::Cursor;
use crate::database::Database;
use crate::entry::{Attribute, Entry};
use crate::entry_index::{self, EntryResolver, StoreResolver};
use crate::env::Environment;
use crate::error::{BackendError, BackendResult, Error};
use crate::index_cfg::{IndexAccess, IndexCfgRegistry, IndexConfig, IndexTypes, IndexingStatus};
use crate::index_write::{
    delete_all_attr_value_metadata, delete_entry_metadata, update_attr_metadata, update_attr_value_metadata,
    update_indices_for_attribute, IndexOp,
};
use crate::key::{decode_entry_id, encode_entry_id, encode_forward_key, encode_reverse_key};
use crate::midl::{ID, IDL};
use crate::parent_index::{children, create_parent_index, delete_parent_index, is_leaf};
use crate::schema::{normalize_dn, Schema, SchemaLookup};
use crate::transaction::Transaction;

/// Main-table key holding the next entry id to hand out
const NEXT_ENTRY_ID_KEY: &[u8] = b"nextEntryId";

/// Candidate selection understood by the index layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Equality { attr: String, value: Vec<u8> },
    /// Values starting with `prefix`, from forward keys
    Initial { attr: String, prefix: Vec<u8> },
    /// Values ending with `suffix`, from reverse keys
    Final { attr: String, suffix: Vec<u8> },
    /// Immediate children of `base_dn`
    OneLevel { base_dn: String },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn equality(attr: &str, value: &[u8]) -> Self {
        Filter::Equality {
            attr: attr.to_string(),
            value: value.to_vec(),
        }
    }

    pub fn initial(attr: &str, prefix: &[u8]) -> Self {
        Filter::Initial {
            attr: attr.to_string(),
            prefix: prefix.to_vec(),
        }
    }

    pub fn final_substring(attr: &str, suffix: &[u8]) -> Self {
        Filter::Final {
            attr: attr.to_string(),
            suffix: suffix.to_vec(),
        }
    }

    pub fn one_level(base_dn: &str) -> Self {
        Filter::OneLevel {
            base_dn: base_dn.to_string(),
        }
    }
}

/// Directory backend
#[derive(Debug)]
pub struct Backend {
    env: Environment,
    config: BackendConfig,
    schema: Schema,
    registry: IndexCfgRegistry,
    entry_db: Database,
    main_db: Database,
}

impl Backend {
    /// Open the environment, its tables and the configured indices
    pub fn open(config: BackendConfig) -> BackendResult<Self> {
        let mut env = Environment::new()?;
        env.set_max_dbs(config.max_dbs)?;
        env.set_max_readers(config.max_readers)?;
        let env = env.open(&config.path, config.env_flags)?;

        let registry = IndexCfgRegistry::new();
        let readonly = config.env_flags.contains(EnvFlags::RDONLY);

        let (entry_db, main_db) = if readonly {
            let txn = env.begin_ro_txn()?;
            let entry_db = Database::open(&txn, Some(ENTRY_DB_NAME))?;
            for def in &config.indices {
                let db = Database::open(&txn, Some(&def.table_name()))?;
                registry.register(IndexConfig::new(def, db, IndexingStatus::Ready));
            }
            (entry_db, Database::open(&txn, None)?)
        } else {
            let mut txn = env.begin_txn()?;
            let entry_db = Database::create(&mut txn, ENTRY_DB_NAME, DbFlags::CREATE)?;
            for def in &config.indices {
                let db = Database::create(&mut txn, &def.table_name(), table_flags(def))?;
                registry.register(IndexConfig::new(def, db, IndexingStatus::Ready));
            }
            let main_db = Database::open(&txn, None)?;
            init_root(&mut txn, &registry, &entry_db, &main_db)?;
            txn.commit()?;
            (entry_db, main_db)
        };

        info!(
            "backend open at {} with {} index(es)",
            config.path.display(),
            config.indices.len()
        );

        Ok(Backend {
            env,
            config,
            schema: Schema::with_builtins(),
            registry,
            entry_db,
            main_db,
        })
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn registry(&self) -> &IndexCfgRegistry {
        &self.registry
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_mut(&mut self) -> &mut Schema {
        &mut self.schema
    }

    pub fn resolver(&self) -> StoreResolver<'_> {
        StoreResolver::new(&self.registry, self.entry_db)
    }

    pub fn begin_txn(&self) -> BackendResult<Transaction<'_>> {
        Ok(self.env.begin_txn()?)
    }

    pub fn begin_ro_txn(&self) -> BackendResult<Transaction<'_>> {
        Ok(self.env.begin_ro_txn()?)
    }

    pub fn get_entry(&self, txn: &Transaction<'_>, entry_id: ID) -> BackendResult<Entry> {
        entry_index::get_entry(txn, &self.entry_db, entry_id)
    }

    pub fn dn_to_entry_id(&self, txn: &Transaction<'_>, dn: &str) -> BackendResult<ID> {
        entry_index::dn_to_entry_id(txn, &self.registry, dn)
    }

    /// Store a new entry and index it, returning its entry id
    pub fn add_entry(&self, txn: &mut Transaction<'_>, entry: &mut Entry) -> BackendResult<ID> {
        let dn = normalize_dn(&entry.dn);
        if dn.is_empty() {
            return Err(BackendError::InvalidParameter("entry without DN".to_string()));
        }

        let resolver = self.resolver();
        let entry_id = self.allocate_entry_id(txn)?;
        entry.eid = entry_id;

        // stored first so uniqueness checks can resolve the entry's own id
        entry_index::put_entry(txn, &self.entry_db, entry_id, &entry.encode()?, true)?;

        update_indices_for_attribute(
            txn,
            &self.registry,
            &resolver,
            &entry.dn,
            ATTR_DN,
            &[dn.into_bytes()],
            entry_id,
            IndexOp::Create,
        )?;
        create_parent_index(txn, &self.registry, &resolver, &entry.dn, entry_id)?;

        for attr in &entry.attrs {
            self.index_attribute(txn, &resolver, &entry.dn, entry_id, attr, IndexOp::Create)?;
        }

        debug!("added entry {} ({})", entry_id, entry.dn);
        Ok(entry_id)
    }

    /// Replace the values of one attribute; an empty value list removes it
    pub fn modify_attribute(
        &self,
        txn: &mut Transaction<'_>,
        entry_id: ID,
        mut attr: Attribute,
    ) -> BackendResult<()> {
        if attr.is_named(ATTR_DN) {
            return Err(BackendError::InvalidParameter(
                "entryDN cannot be modified".to_string(),
            ));
        }

        let resolver = self.resolver();
        let mut entry = self.get_entry(txn, entry_id)?;
        let old = entry.find_attribute(&attr.name).cloned();

        let old_values = old
            .as_ref()
            .map(|old| self.normalized_values(old))
            .unwrap_or_default();
        let new_values = self.normalized_values(&attr);
        let removed: Vec<Vec<u8>> = old_values
            .iter()
            .filter(|value| !new_values.contains(value))
            .cloned()
            .collect();
        let added: Vec<Vec<u8>> = new_values
            .iter()
            .filter(|value| !old_values.contains(value))
            .cloned()
            .collect();

        update_indices_for_attribute(
            txn,
            &self.registry,
            &resolver,
            &entry.dn,
            &attr.name,
            &removed,
            entry_id,
            IndexOp::Delete,
        )?;
        update_indices_for_attribute(
            txn,
            &self.registry,
            &resolver,
            &entry.dn,
            &attr.name,
            &added,
            entry_id,
            IndexOp::Create,
        )?;

        if attr.metadata.is_none() {
            attr.metadata = old.as_ref().and_then(|old| old.metadata.clone());
        }
        if let Some(attr_id) = self.schema.attr_id(&attr.name) {
            // A record may outlive its attribute, so always overwrite
            if let Some(meta) = &attr.metadata {
                update_attr_metadata(
                    txn,
                    &self.registry,
                    attr_id,
                    &meta.serialize()?,
                    entry_id,
                    IndexOp::Update,
                )?;
            }
            if self.config.concurrent_attr_value_update && !attr.value_metadata.is_empty() {
                update_attr_value_metadata(
                    txn,
                    &self.registry,
                    entry_id,
                    attr_id,
                    IndexOp::Update,
                    &attr.value_metadata,
                )?;
            }
        }

        if attr.values.is_empty() {
            entry.remove_attribute(&attr.name);
        } else {
            entry.replace_attribute(attr);
        }
        entry_index::put_entry(txn, &self.entry_db, entry_id, &entry.encode()?, false)
    }

    /// Remove a leaf entry with all of its index records
    pub fn delete_entry(&self, txn: &mut Transaction<'_>, entry_id: ID) -> BackendResult<()> {
        if entry_id == DSE_ROOT_ENTRY_ID {
            return Err(BackendError::InvalidParameter("the root entry cannot be deleted".to_string()));
        }

        let entry = self.get_entry(txn, entry_id)?;
        if !is_leaf(txn, &self.registry, entry_id)? {
            return Err(BackendError::InvalidParameter(format!(
                "entry {} has children",
                entry.dn
            )));
        }

        let resolver = self.resolver();
        for attr in &entry.attrs {
            self.index_attribute(txn, &resolver, &entry.dn, entry_id, attr, IndexOp::Delete)?;
        }

        update_indices_for_attribute(
            txn,
            &self.registry,
            &resolver,
            &entry.dn,
            ATTR_DN,
            &[normalize_dn(&entry.dn).into_bytes()],
            entry_id,
            IndexOp::Delete,
        )?;
        delete_parent_index(txn, &self.registry, &resolver, &entry.dn, entry_id)?;
        // Removed attributes keep their metadata until the entry goes
        delete_entry_metadata(txn, &self.registry, entry_id)?;
        entry_index::delete_entry(txn, &self.entry_db, entry_id)?;

        debug!("deleted entry {} ({})", entry_id, entry.dn);
        Ok(())
    }

    /// Entry ids that may match `filter`
    pub fn search_candidates(&self, txn: &Transaction<'_>, filter: &Filter) -> BackendResult<IDL> {
        match filter {
            Filter::Equality { attr, value } => {
                let key = encode_forward_key(&self.schema.normalize(attr, value));
                self.scan_index(txn, attr, IndexTypes::EQUALITY, &key, false)
            }
            Filter::Initial { attr, prefix } => {
                let key = encode_forward_key(&self.schema.normalize(attr, prefix));
                self.scan_index(txn, attr, IndexTypes::EQUALITY, &key, true)
            }
            Filter::Final { attr, suffix } => {
                let key = encode_reverse_key(&self.schema.normalize(attr, suffix));
                self.scan_index(txn, attr, IndexTypes::SUBSTR, &key, true)
            }
            Filter::OneLevel { base_dn } => {
                let parent_id = self.dn_to_entry_id(txn, base_dn)?;
                children(txn, &self.registry, parent_id)
            }
            Filter::And(filters) => {
                let mut parts = filters.iter();
                let first = parts
                    .next()
                    .ok_or_else(|| BackendError::InvalidParameter("empty AND filter".to_string()))?;
                let mut idl = self.search_candidates(txn, first)?;
                for part in parts {
                    if idl.is_empty() {
                        break;
                    }
                    idl = idl.intersection(self.search_candidates(txn, part)?);
                }
                Ok(idl)
            }
            Filter::Or(filters) => {
                let mut idl = IDL::new();
                for part in filters {
                    idl = idl.union(self.search_candidates(txn, part)?);
                }
                Ok(idl)
            }
        }
    }

    /// Index a new attribute over existing entries
    ///
    /// Readers see the index as missing until every entry has been indexed.
    pub fn add_index(&self, def: IndexDefinition) -> BackendResult<()> {
        if self.registry.try_acquire(&def.attr_name, IndexAccess::Write).is_some() {
            return Err(BackendError::InvalidParameter(format!(
                "index {} is already configured",
                def.attr_name
            )));
        }

        let mut txn = self.begin_txn()?;
        let db = Database::create(&mut txn, &def.table_name(), table_flags(&def))?;
        self.registry
            .register(IndexConfig::new(&def, db, IndexingStatus::Building));

        let result = self.build_index(&mut txn, &def).and_then(|count| {
            txn.commit()?;
            Ok(count)
        });
        match result {
            Ok(count) => {
                self.registry.set_status(&def.attr_name, IndexingStatus::Ready)?;
                info!("index {} built over {} entries", def.attr_name, count);
                Ok(())
            }
            Err(err) => {
                warn!("building index {} failed: {}", def.attr_name, err);
                self.registry.unregister(&def.attr_name);
                Err(err)
            }
        }
    }

    fn build_index(&self, txn: &mut Transaction<'_>, def: &IndexDefinition) -> BackendResult<usize> {
        let entries = {
            let cursor = Cursor::new(txn, &self.entry_db)?;
            let mut entries = Vec::new();
            let mut pair = cursor.first()?;
            while let Some((_, data)) = pair {
                let entry = Entry::decode(data)?;
                if entry.find_attribute(&def.attr_name).is_some() {
                    entries.push(entry);
                }
                pair = cursor.next()?;
            }
            entries
        };

        let resolver = self.resolver();
        for entry in &entries {
            if let Some(attr) = entry.find_attribute(&def.attr_name) {
                update_indices_for_attribute(
                    txn,
                    &self.registry,
                    &resolver,
                    &entry.dn,
                    &def.attr_name,
                    &self.normalized_values(attr),
                    entry.eid,
                    IndexOp::Create,
                )?;
            }
        }
        Ok(entries.len())
    }

    fn scan_index(
        &self,
        txn: &Transaction<'_>,
        attr: &str,
        required: IndexTypes,
        key: &[u8],
        prefix: bool,
    ) -> BackendResult<IDL> {
        let cfg = self.registry.acquire(attr, IndexAccess::Read)?;
        if !cfg.index_types().contains(required) {
            return Err(BackendError::NotFound(format!(
                "{} has no {:?} index",
                attr, required
            )));
        }

        let cursor = Cursor::new(txn, &cfg.db())?;
        let mut idl = IDL::new();
        let mut pair = if prefix { cursor.set_range(key)? } else { cursor.set(key)? };
        while let Some((found, data)) = pair {
            let matches = if prefix { found.starts_with(key) } else { found == key };
            if !matches {
                break;
            }
            idl.append(decode_entry_id(data).ok_or(Error::Corrupted)?);
            pair = cursor.next()?;
        }
        idl.sort();
        Ok(idl)
    }

    fn normalized_values(&self, attr: &Attribute) -> Vec<Vec<u8>> {
        let mut out: Vec<Vec<u8>> = Vec::with_capacity(attr.values.len());
        for value in &attr.values {
            let normalized = self.schema.normalize(&attr.name, value);
            if !out.contains(&normalized) {
                out.push(normalized);
            }
        }
        out
    }

    fn index_attribute(
        &self,
        txn: &mut Transaction<'_>,
        resolver: &dyn EntryResolver,
        dn: &str,
        entry_id: ID,
        attr: &Attribute,
        op: IndexOp,
    ) -> BackendResult<()> {
        update_indices_for_attribute(
            txn,
            &self.registry,
            resolver,
            dn,
            &attr.name,
            &self.normalized_values(attr),
            entry_id,
            op,
        )?;

        let Some(attr_id) = self.schema.attr_id(&attr.name) else {
            return Ok(());
        };
        if let Some(meta) = &attr.metadata {
            update_attr_metadata(txn, &self.registry, attr_id, &meta.serialize()?, entry_id, op)?;
        }
        if self.config.concurrent_attr_value_update {
            match op {
                IndexOp::Delete => delete_all_attr_value_metadata(txn, &self.registry, entry_id, attr_id)?,
                _ if !attr.value_metadata.is_empty() => update_attr_value_metadata(
                    txn,
                    &self.registry,
                    entry_id,
                    attr_id,
                    op,
                    &attr.value_metadata,
                )?,
                _ => {}
            }
        }
        Ok(())
    }

    fn allocate_entry_id(&self, txn: &mut Transaction<'_>) -> BackendResult<ID> {
        let next = match self.main_db.get(txn, NEXT_ENTRY_ID_KEY)? {
            Some(raw) => decode_entry_id(raw).ok_or(Error::Corrupted)?,
            None => DSE_ROOT_ENTRY_ID + 1,
        };
        self.main_db
            .put(txn, NEXT_ENTRY_ID_KEY, &encode_entry_id(next + 1), WriteFlags::empty())?;
        Ok(next)
    }
}

fn table_flags(def: &IndexDefinition) -> DbFlags {
    if def.global_unique {
        DbFlags::CREATE
    } else {
        DbFlags::CREATE | DbFlags::DUPSORT
    }
}

/// Store the root entry the first time a backend is opened
fn init_root(
    txn: &mut Transaction<'_>,
    registry: &IndexCfgRegistry,
    entry_db: &Database,
    main_db: &Database,
) -> BackendResult<()> {
    if entry_db.get(txn, &encode_entry_id(DSE_ROOT_ENTRY_ID))?.is_some() {
        return Ok(());
    }

    let mut root = Entry::new(PERSISTED_DSE_ROOT_DN);
    root.eid = DSE_ROOT_ENTRY_ID;
    entry_index::put_entry(txn, entry_db, DSE_ROOT_ENTRY_ID, &root.encode()?, true)?;

    let resolver = StoreResolver::new(registry, *entry_db);
    update_indices_for_attribute(
        txn,
        registry,
        &resolver,
        PERSISTED_DSE_ROOT_DN,
        ATTR_DN,
        &[normalize_dn(PERSISTED_DSE_ROOT_DN).into_bytes()],
        DSE_ROOT_ENTRY_ID,
        IndexOp::Create,
    )?;

    main_db.put(
        txn,
        NEXT_ENTRY_ID_KEY,
        &encode_entry_id(DSE_ROOT_ENTRY_ID + 1),
        WriteFlags::NOOVERWRITE,
    )?;
    info!("created root entry");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Backend {
        Backend::open(BackendConfig::new(dir.path()).with_env_flags(EnvFlags::NOSYNC)).unwrap()
    }

    #[test]
    fn test_open_creates_root() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        let txn = backend.begin_ro_txn().unwrap();

        let root = backend.get_entry(&txn, DSE_ROOT_ENTRY_ID).unwrap();
        assert_eq!(root.dn, PERSISTED_DSE_ROOT_DN);
        assert_eq!(backend.dn_to_entry_id(&txn, "cn=dse root").unwrap(), DSE_ROOT_ENTRY_ID);
        assert_eq!(backend.dn_to_entry_id(&txn, "").unwrap(), DSE_ROOT_ENTRY_ID);
        assert_eq!(backend.registry().names().len(), 5);
    }

    #[test]
    fn test_entry_ids_are_not_reused() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);

        let mut txn = backend.begin_txn().unwrap();
        let first = backend
            .add_entry(&mut txn, &mut Entry::new("dc=example"))
            .unwrap();
        backend.delete_entry(&mut txn, first).unwrap();
        let second = backend
            .add_entry(&mut txn, &mut Entry::new("dc=example"))
            .unwrap();
        txn.commit().unwrap();

        assert_eq!(first, DSE_ROOT_ENTRY_ID + 1);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_delete_refuses_non_leaf() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);

        let mut txn = backend.begin_txn().unwrap();
        let parent = backend.add_entry(&mut txn, &mut Entry::new("dc=example")).unwrap();
        let child = backend
            .add_entry(&mut txn, &mut Entry::new("ou=people,dc=example"))
            .unwrap();

        assert!(matches!(
            backend.delete_entry(&mut txn, parent),
            Err(BackendError::InvalidParameter(_))
        ));
        backend.delete_entry(&mut txn, child).unwrap();
        backend.delete_entry(&mut txn, parent).unwrap();
        assert!(backend.get_entry(&txn, parent).unwrap_err().is_not_found());
    }

    #[test]
    fn test_missing_parent_fails_add() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);

        let mut txn = backend.begin_txn().unwrap();
        let err = backend
            .add_entry(&mut txn, &mut Entry::new("cn=orphan,dc=nowhere"))
            .unwrap_err();
        assert!(matches!(err, BackendError::EntryNotFound(_)));
    }
}
