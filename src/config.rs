use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};

use crate::constants::{
    EnvFlags, ATTR_ATTR_META_DATA, ATTR_ATTR_VALUE_META_DATA, ATTR_DN, ATTR_OBJECT_GUID,
    ATTR_PARENT_ID, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS,
};
use crate::index_cfg::IndexTypes;

/// Index set every backend carries
static BUILTIN_INDICES: Lazy<Vec<IndexDefinition>> = Lazy::new(|| {
    vec![
        IndexDefinition::new(ATTR_DN, IndexTypes::EQUALITY).with_global_unique(true),
        IndexDefinition::new(ATTR_OBJECT_GUID, IndexTypes::EQUALITY).with_global_unique(true),
        IndexDefinition::new(ATTR_PARENT_ID, IndexTypes::EQUALITY),
        IndexDefinition::new(ATTR_ATTR_META_DATA, IndexTypes::EQUALITY).with_global_unique(true),
        IndexDefinition::new(ATTR_ATTR_VALUE_META_DATA, IndexTypes::EQUALITY),
    ]
});

/// Indexing configuration of one attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub attr_name: String,
    pub index_types: IndexTypes,
    /// One entry id per key, enforced with no-overwrite puts
    pub global_unique: bool,
    /// DN suffixes under which values must be unique
    pub uniq_scopes: Vec<String>,
}

impl IndexDefinition {
    pub fn new(attr_name: &str, index_types: IndexTypes) -> Self {
        IndexDefinition {
            attr_name: attr_name.to_string(),
            index_types,
            global_unique: false,
            uniq_scopes: Vec::new(),
        }
    }

    pub fn with_global_unique(mut self, global_unique: bool) -> Self {
        self.global_unique = global_unique;
        self
    }

    pub fn with_scope(mut self, scope: &str) -> Self {
        self.uniq_scopes.push(scope.to_string());
        self
    }

    /// Name of the table backing this index
    pub fn table_name(&self) -> String {
        self.attr_name.to_ascii_lowercase()
    }
}

/// Backend configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Environment directory
    pub path: PathBuf,
    pub env_flags: EnvFlags,
    pub max_dbs: u32,
    pub max_readers: u32,
    /// Maintain per-value replication metadata alongside attribute metadata
    pub concurrent_attr_value_update: bool,
    pub indices: Vec<IndexDefinition>,
}

impl BackendConfig {
    /// Configuration with the built-in index set
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        BackendConfig {
            path: path.as_ref().to_path_buf(),
            env_flags: EnvFlags::empty(),
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
            concurrent_attr_value_update: true,
            indices: BUILTIN_INDICES.clone(),
        }
    }

    pub fn with_env_flags(mut self, flags: EnvFlags) -> Self {
        self.env_flags = flags;
        self
    }

    pub fn with_max_dbs(mut self, max_dbs: u32) -> Self {
        self.max_dbs = max_dbs;
        self
    }

    pub fn with_max_readers(mut self, max_readers: u32) -> Self {
        self.max_readers = max_readers;
        self
    }

    pub fn with_concurrent_attr_value_update(mut self, enabled: bool) -> Self {
        self.concurrent_attr_value_update = enabled;
        self
    }

    /// Add an index, replacing any earlier definition for the same attribute
    pub fn with_index(mut self, def: IndexDefinition) -> Self {
        self.indices
            .retain(|existing| !existing.attr_name.eq_ignore_ascii_case(&def.attr_name));
        self.indices.push(def);
        self
    }

    pub fn index(&self, attr_name: &str) -> Option<&IndexDefinition> {
        self.indices
            .iter()
            .find(|def| def.attr_name.eq_ignore_ascii_case(attr_name))
    }
}
