use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        const NOSUBDIR = 0x4000;
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
        const NOMETASYNC = 0x40000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        const DUPSORT = 0x04;
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransactionFlags: u32 {
        // Reuse environment flags
        const RDONLY = EnvFlags::RDONLY.bits();
        const NOSYNC = EnvFlags::NOSYNC.bits();

        // Transaction-specific flags
        const FINISHED = 0x01;
        const ERROR = 0x02;
        const DIRTY = 0x04;
    }
}

/// Magic number for data files
pub const MDB_MAGIC: u32 = 0xBEEF_DEAD;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 9;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 70;
/// Packed on-disk version
pub const MDB_VERSION: u32 = VERSION_MAJOR << 24 | VERSION_MINOR << 16 | VERSION_PATCH;

/// Data file name inside the environment directory
pub const DATA_FILE_NAME: &str = "data.mdb";

pub const DEFAULT_MAX_DBS: u32 = 32;
pub const DEFAULT_MAX_READERS: u32 = 126;
/// Largest key accepted by `put`
pub const MAX_KEY_SIZE: usize = 511;

/// Sentinel name of the unnamed main database in the data file
pub(crate) const MAIN_DB_NAME_LEN: u16 = u16::MAX;

// ---------------------------------------------------------------------------
// Directory backend constants
// ---------------------------------------------------------------------------

/// Type byte of a forward (equality) index key
pub const KEY_TYPE_FWD: u8 = b'0';
/// Type byte of a reverse (final substring) index key
pub const KEY_TYPE_REV: u8 = b'1';
/// Separator between the entry id and attribute id of a metadata key
pub const ATTR_META_KEY_SEPARATOR: u8 = b':';

/// DN of the root DSE entry, also the "whole tree" uniqueness scope
pub const PERSISTED_DSE_ROOT_DN: &str = "cn=DSE Root";
/// Entry id the empty DN resolves to
pub const DSE_ROOT_ENTRY_ID: u64 = 1;

pub const ATTR_DN: &str = "entryDN";
pub const ATTR_OBJECT_GUID: &str = "objectGUID";
pub const ATTR_PARENT_ID: &str = "parentId";
pub const ATTR_ATTR_META_DATA: &str = "attrMetaData";
pub const ATTR_ATTR_VALUE_META_DATA: &str = "attrValueMetaData";
/// Table holding EntryID => encoded entry
pub const ENTRY_DB_NAME: &str = "entryBlob";

/// Length of `YYYYMMDDhhmmss.mmm` originating time strings (without terminator)
pub const ORIG_TIME_STR_LEN: usize = 18;

/// Truncation limit for keys/values dumped into verbose logs
pub const MAX_LOG_OUTPUT_LEN: usize = 256;
