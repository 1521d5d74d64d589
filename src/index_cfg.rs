//! Per-attribute index configuration and the process-wide registry.
//!
//! The registry owns every [`IndexConfig`]; callers hold an
//! [`IndexCfgHandle`] for as long as they use one, so a configuration that is
//! unregistered while a uniqueness check runs stays alive until the check
//! drops its handle.

use bitflags::bitflags;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::config::IndexDefinition;
use crate::database::Database;
use crate::entry_index::EntryResolver;
use crate::error::{BackendError, BackendResult};
use crate::transaction::Transaction;
use crate::uniqueness;

bitflags! {
    /// Index types enabled for an attribute
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IndexTypes: u32 {
        /// Forward keys: equality and initial-substring lookups
        const EQUALITY = 0x01;
        /// Reverse keys: final-substring lookups
        const SUBSTR = 0x02;
    }
}

/// Progress of background indexing work on one attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexingStatus {
    #[default]
    Ready,
    /// Existing entries are still being indexed; reads would miss them
    Building,
    /// New uniqueness scopes are being checked against the live index
    ValidatingScopes,
}

/// How a caller intends to use an index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexAccess {
    Read,
    Write,
}

/// Uniqueness scopes of one attribute
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniqScopes {
    /// Scopes currently enforced
    pub committed: BTreeSet<String>,
    /// Scopes being validated before they are enforced
    pub pending: Option<Vec<String>>,
}

impl UniqScopes {
    /// Pending scopes, only while they are being validated
    pub fn effective_pending(&self, status: IndexingStatus) -> &[String] {
        match (&self.pending, status) {
            (Some(pending), IndexingStatus::ValidatingScopes) => pending.as_slice(),
            _ => &[],
        }
    }
}

/// Mutable part of an index configuration
#[derive(Debug, Clone, Default)]
pub struct IndexState {
    pub status: IndexingStatus,
    pub scopes: UniqScopes,
}

/// Index configuration of one attribute
pub struct IndexConfig {
    attr_name: String,
    index_types: IndexTypes,
    global_unique: bool,
    db: Database,
    state: Mutex<IndexState>,
}

impl fmt::Debug for IndexConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexConfig")
            .field("attr_name", &self.attr_name)
            .field("index_types", &self.index_types)
            .field("global_unique", &self.global_unique)
            .field("db", &self.db)
            .finish()
    }
}

impl IndexConfig {
    pub fn new(def: &IndexDefinition, db: Database, status: IndexingStatus) -> Self {
        IndexConfig {
            attr_name: def.attr_name.clone(),
            index_types: def.index_types,
            global_unique: def.global_unique,
            db,
            state: Mutex::new(IndexState {
                status,
                scopes: UniqScopes {
                    committed: def.uniq_scopes.iter().cloned().collect(),
                    pending: None,
                },
            }),
        }
    }

    pub fn attr_name(&self) -> &str {
        &self.attr_name
    }

    pub fn index_types(&self) -> IndexTypes {
        self.index_types
    }

    pub fn global_unique(&self) -> bool {
        self.global_unique
    }

    /// Table holding this attribute's forward and reverse keys
    pub fn db(&self) -> Database {
        self.db
    }

    /// Lock the mutable state
    ///
    /// Uniqueness checks hold this guard across their whole scan.
    pub fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> IndexingStatus {
        self.lock().status
    }

    /// Snapshot of the scope sets
    pub fn scopes(&self) -> UniqScopes {
        self.lock().scopes.clone()
    }
}

/// Reference-counted handle to a registered configuration
///
/// Dropping the handle releases it.
#[derive(Debug, Clone)]
pub struct IndexCfgHandle(Arc<IndexConfig>);

impl IndexCfgHandle {
    /// Number of live references, the registry's own included
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Deref for IndexCfgHandle {
    type Target = IndexConfig;

    fn deref(&self) -> &IndexConfig {
        &self.0
    }
}

/// Registry of index configurations, keyed by case-folded attribute name
#[derive(Debug, Default)]
pub struct IndexCfgRegistry {
    configs: RwLock<HashMap<String, Arc<IndexConfig>>>,
}

impl IndexCfgRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    /// Register a configuration, replacing any previous one for the attribute
    pub fn register(&self, config: IndexConfig) -> IndexCfgHandle {
        let config = Arc::new(config);
        debug!(
            "register index {} types={:?} unique={}",
            config.attr_name, config.index_types, config.global_unique
        );
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::key(&config.attr_name), Arc::clone(&config));
        IndexCfgHandle(config)
    }

    /// Remove a configuration; outstanding handles keep it alive
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::key(name));
        if removed.is_some() {
            info!("unregistered index {}", name);
        }
        removed.is_some()
    }

    /// Acquire a handle for an indexed attribute
    ///
    /// Fails with `NotFound` when the attribute is not indexed, and for
    /// `Read` access while the index is still being built.
    pub fn acquire(&self, name: &str, access: IndexAccess) -> BackendResult<IndexCfgHandle> {
        let config = self
            .configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::key(name))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("no index configured for {}", name)))?;

        if access == IndexAccess::Read && config.status() == IndexingStatus::Building {
            return Err(BackendError::NotFound(format!("index {} is being built", name)));
        }

        Ok(IndexCfgHandle(config))
    }

    /// Like `acquire`, with "not indexed" folded into `None`
    pub fn try_acquire(&self, name: &str, access: IndexAccess) -> Option<IndexCfgHandle> {
        self.acquire(name, access).ok()
    }

    pub fn get_dbi(&self, handle: &IndexCfgHandle) -> Database {
        handle.db()
    }

    pub fn names(&self) -> Vec<String> {
        let configs = self.configs.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = configs.values().map(|cfg| cfg.attr_name.clone()).collect();
        names.sort();
        names
    }

    pub fn set_status(&self, name: &str, status: IndexingStatus) -> BackendResult<()> {
        let handle = self.acquire(name, IndexAccess::Write)?;
        let mut state = handle.lock();
        debug!("index {} status {:?} -> {:?}", name, state.status, status);
        state.status = status;
        Ok(())
    }

    /// Stage new uniqueness scopes for validation
    pub fn begin_scope_validation(&self, name: &str, new_scopes: Vec<String>) -> BackendResult<()> {
        if new_scopes.is_empty() {
            return Err(BackendError::InvalidParameter(format!(
                "no uniqueness scopes given for {}",
                name
            )));
        }

        let handle = self.acquire(name, IndexAccess::Write)?;
        let mut state = handle.lock();
        if state.status != IndexingStatus::Ready {
            return Err(BackendError::InvalidParameter(format!(
                "index {} is busy ({:?})",
                name, state.status
            )));
        }

        state.scopes.pending = Some(new_scopes);
        state.status = IndexingStatus::ValidatingScopes;
        Ok(())
    }

    /// Check staged scopes against the values already indexed
    ///
    /// Writers that run meanwhile already enforce the staged scopes.
    pub fn validate_pending_scopes(
        &self,
        txn: &Transaction<'_>,
        name: &str,
        resolver: &dyn EntryResolver,
    ) -> BackendResult<()> {
        let handle = self.acquire(name, IndexAccess::Write)?;
        let pending = {
            let state = handle.lock();
            match (&state.scopes.pending, state.status) {
                (Some(pending), IndexingStatus::ValidatingScopes) => pending.clone(),
                _ => {
                    return Err(BackendError::InvalidParameter(format!(
                        "index {} has no scopes under validation",
                        name
                    )))
                }
            }
        };

        uniqueness::check_existing_values(txn, &handle, resolver, &pending)
    }

    /// Start enforcing the staged scopes
    pub fn commit_pending_scopes(&self, name: &str) -> BackendResult<()> {
        let handle = self.acquire(name, IndexAccess::Write)?;
        let mut state = handle.lock();
        let pending = state.scopes.pending.take().ok_or_else(|| {
            BackendError::InvalidParameter(format!("index {} has no scopes under validation", name))
        })?;
        info!("index {}: enforcing {} new uniqueness scope(s)", name, pending.len());
        state.scopes.committed.extend(pending);
        state.status = IndexingStatus::Ready;
        Ok(())
    }

    /// Drop the staged scopes
    pub fn abort_pending_scopes(&self, name: &str) -> BackendResult<()> {
        let handle = self.acquire(name, IndexAccess::Write)?;
        let mut state = handle.lock();
        if state.scopes.pending.take().is_some() {
            warn!("index {}: staged uniqueness scopes discarded", name);
        }
        state.status = IndexingStatus::Ready;
        Ok(())
    }
}
