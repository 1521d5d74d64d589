use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for store operations
pub type Result<T> = result::Result<T, Error>;

/// Result type of the directory backend layer
pub type BackendResult<T> = result::Result<T, BackendError>;

/// Storage engine error codes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("No matching key/data pair found")]
    NotFound,
    /// Database file is corrupted
    #[error("Database file is corrupted")]
    Corrupted,
    /// Database version mismatch
    #[error("Database version mismatch")]
    VersionMismatch,
    /// File is not a valid data file
    #[error("File is not a valid LMDB file")]
    Invalid,
    /// Environment maxdbs limit reached
    #[error("Environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("Environment maxreaders limit reached")]
    ReadersFull,
    /// Operation and DB incompatible
    #[error("Operation and DB incompatible")]
    Incompatible,
    /// Transaction must abort, has a child, or is invalid
    #[error("Transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Unsupported size of key/DB name/data
    #[error("Unsupported size of key/DB name/data")]
    BadValSize,
    /// The specified DBI was changed unexpectedly
    #[error("The specified DBI was changed unexpectedly")]
    BadDbi,
    /// Environment is already open
    #[error("Environment is already open")]
    EnvAlreadyOpen,
    /// Environment is not initialized
    #[error("Environment is not initialized")]
    EnvNotInitialized,
    /// Environment is read-only
    #[error("Environment is read-only")]
    EnvReadOnly,
    /// Environment path is invalid
    #[error("Invalid environment path")]
    EnvInvalidPath,
    /// Environment flags cannot be modified
    #[error("Environment flags cannot be modified")]
    EnvFlagsImmutable,
    /// Operation not allowed in read-only transaction
    #[error("Transaction is read-only")]
    TxnReadOnly,
    /// Memory sync failed
    #[error("Memory sync operation failed")]
    SyncFailed,
    /// I/O failure while reading or writing the data file
    #[error("I/O error: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::Corrupted,
            kind => Error::Io(kind),
        }
    }
}

/// Directory backend errors surfaced to the operation layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Null or malformed caller arguments
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Attribute not configured for indexing, or a lookup missed
    #[error("not found: {0}")]
    NotFound(String),
    /// DN or entry id does not resolve to an entry
    #[error("entry not found: {0}")]
    EntryNotFound(String),
    /// Attribute has no stored metadata for the entry
    #[error("attribute metadata not found: entry {entry_id}, attribute id {attr_id}")]
    AttrMetaDataNotFound { entry_id: u64, attr_id: u16 },
    /// Uniqueness scope already holds the value
    #[error("constraint violation: attribute '{attr}' value already exists in scope '{scope}'")]
    DataConstraintViolation { attr: String, scope: String },
    /// Stored metadata string is malformed
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),
    /// Underlying storage engine failure
    #[error("storage error: {0}")]
    Storage(#[from] Error),
}

/// LDAP result codes used by the front end
pub mod ldap_result {
    pub const SUCCESS: u32 = 0;
    pub const CONSTRAINT_VIOLATION: u32 = 19;
    pub const NO_SUCH_OBJECT: u32 = 32;
    pub const UNWILLING_TO_PERFORM: u32 = 53;
    pub const OTHER: u32 = 80;
}

impl BackendError {
    /// LDAP result code reported to the client for this failure
    pub fn ldap_result_code(&self) -> u32 {
        match self {
            BackendError::DataConstraintViolation { .. } => ldap_result::CONSTRAINT_VIOLATION,
            BackendError::EntryNotFound(_) => ldap_result::NO_SUCH_OBJECT,
            BackendError::InvalidParameter(_) => ldap_result::UNWILLING_TO_PERFORM,
            BackendError::Storage(Error::KeyExist) => ldap_result::CONSTRAINT_VIOLATION,
            _ => ldap_result::OTHER,
        }
    }

    /// True when the error means "nothing stored here" rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackendError::NotFound(_)
                | BackendError::EntryNotFound(_)
                | BackendError::AttrMetaDataNotFound { .. }
                | BackendError::Storage(Error::NotFound)
        )
    }
}
