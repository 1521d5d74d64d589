//! Per-attribute replication metadata.
//!
//! Stored form is `localUsn:version:originInvoId:originTime:originUsn`.

use log::error;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::constants::{ATTR_ATTR_META_DATA, ORIG_TIME_STR_LEN};
use crate::cursor::Cursor;
use crate::error::{BackendError, BackendResult};
use crate::index_cfg::{IndexAccess, IndexCfgRegistry};
use crate::key::{attr_meta_key_prefix, decode_attr_meta_key, encode_attr_meta_key};
use crate::midl::ID;
use crate::transaction::Transaction;

const FIELD_COUNT: usize = 5;

/// Replication metadata of one attribute of one entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeMetadata {
    /// USN of the last local change
    pub local_usn: i64,
    pub version: u64,
    /// Server instance that originated the change
    pub origin_invocation_id: String,
    /// `YYYYMMDDhhmmss.mmm` origin timestamp
    pub origin_time: String,
    pub origin_usn: i64,
}

impl AttributeMetadata {
    pub fn new(local_usn: i64, version: u64, origin_invocation_id: &str, origin_time: &str, origin_usn: i64) -> Self {
        AttributeMetadata {
            local_usn,
            version,
            origin_invocation_id: origin_invocation_id.to_string(),
            origin_time: origin_time.to_string(),
            origin_usn,
        }
    }

    /// True until an originating server has been recorded
    pub fn is_empty(&self) -> bool {
        self.origin_invocation_id.is_empty()
    }

    pub fn set_local_usn(&mut self, local_usn: i64) {
        self.local_usn = local_usn;
    }

    pub fn serialize(&self) -> BackendResult<String> {
        if self.origin_invocation_id.is_empty() || self.origin_time.is_empty() {
            return Err(BackendError::InvalidParameter(
                "attribute metadata without origin".to_string(),
            ));
        }
        Ok(self.to_string())
    }

    pub fn deserialize(s: &str) -> BackendResult<Self> {
        let tokens: Vec<&str> = s.split(':').collect();
        if tokens.len() != FIELD_COUNT {
            error!("attribute metadata has {} fields: {}", tokens.len(), s);
            return Err(BackendError::CorruptMetadata(s.to_string()));
        }

        let corrupt = |_| BackendError::CorruptMetadata(s.to_string());
        Ok(AttributeMetadata {
            local_usn: tokens[0].parse().map_err(corrupt)?,
            version: tokens[1].parse().map_err(corrupt)?,
            origin_invocation_id: tokens[2].to_string(),
            origin_time: tokens[3].to_string(),
            origin_usn: tokens[4].parse().map_err(corrupt)?,
        })
    }

    /// Order two competing changes: version, then origin time, then origin
    /// invocation id. The greater one wins.
    pub fn resolve_conflict(&self, other: &AttributeMetadata) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| time_prefix(&self.origin_time).cmp(time_prefix(&other.origin_time)))
            .then_with(|| self.origin_invocation_id.cmp(&other.origin_invocation_id))
    }

    /// True when this change wins over `other`
    pub fn supersedes(&self, other: &AttributeMetadata) -> bool {
        self.resolve_conflict(other) == Ordering::Greater
    }
}

/// Origin times compare on their fixed-width `YYYYMMDDhhmmss.mmm` part only
fn time_prefix(time: &str) -> &str {
    time.get(..ORIG_TIME_STR_LEN).unwrap_or(time)
}

impl fmt::Display for AttributeMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.local_usn, self.version, self.origin_invocation_id, self.origin_time, self.origin_usn
        )
    }
}

impl FromStr for AttributeMetadata {
    type Err = BackendError;

    fn from_str(s: &str) -> BackendResult<Self> {
        AttributeMetadata::deserialize(s)
    }
}

/// Stored metadata of one attribute
pub fn get_attr_metadata(
    txn: &Transaction<'_>,
    registry: &IndexCfgRegistry,
    entry_id: ID,
    attr_id: u16,
) -> BackendResult<AttributeMetadata> {
    let cfg = registry.acquire(ATTR_ATTR_META_DATA, IndexAccess::Read)?;
    let key = encode_attr_meta_key(entry_id, attr_id);
    let raw = cfg
        .db()
        .get(txn, &key)?
        .ok_or(BackendError::AttrMetaDataNotFound { entry_id, attr_id })?;
    let text = std::str::from_utf8(raw)
        .map_err(|_| BackendError::CorruptMetadata(String::from_utf8_lossy(raw).into_owned()))?;
    AttributeMetadata::deserialize(text)
}

/// Every stored attribute metadata of one entry, by attribute id
pub fn get_all_attrs_metadata(
    txn: &Transaction<'_>,
    registry: &IndexCfgRegistry,
    entry_id: ID,
) -> BackendResult<Vec<(u16, AttributeMetadata)>> {
    let cfg = registry.acquire(ATTR_ATTR_META_DATA, IndexAccess::Read)?;
    let prefix = attr_meta_key_prefix(entry_id);
    let cursor = Cursor::new(txn, &cfg.db())?;

    let mut all = Vec::new();
    let mut pair = cursor.set_range(&prefix)?;
    while let Some((key, data)) = pair {
        if !key.starts_with(&prefix) {
            break;
        }
        let (_, attr_id) = decode_attr_meta_key(key)
            .ok_or_else(|| BackendError::CorruptMetadata(format!("bad metadata key {:?}", key)))?;
        let text = std::str::from_utf8(data)
            .map_err(|_| BackendError::CorruptMetadata(String::from_utf8_lossy(data).into_owned()))?;
        all.push((attr_id, AttributeMetadata::deserialize(text)?));
        pair = cursor.next()?;
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_string_is_preserved() {
        let text = "1042:3:invoid-abc:20230101000000.000Z:998";
        let meta: AttributeMetadata = text.parse().unwrap();
        assert_eq!(
            meta,
            AttributeMetadata::new(1042, 3, "invoid-abc", "20230101000000.000Z", 998)
        );
        assert_eq!(meta.serialize().unwrap(), text);
    }

    #[test]
    fn test_serialize_then_deserialize() {
        let metas = [
            AttributeMetadata::new(-1, 0, "a", "20200101000000.000", 0),
            AttributeMetadata::new(i64::MAX, u64::MAX, "7f2c-4e1d", "20991231235959.999", i64::MIN),
        ];
        for meta in metas {
            let text = meta.serialize().unwrap();
            assert_eq!(AttributeMetadata::deserialize(&text).unwrap(), meta);
        }
    }

    #[test]
    fn test_malformed_strings_are_corrupt() {
        for text in [
            "",
            "1:2:inv:time",
            "1:2:inv:time:5:6",
            "x:2:inv:time:5",
            "1:-2:inv:time:5",
            "1:2:inv:time:five",
        ] {
            assert!(
                matches!(AttributeMetadata::deserialize(text), Err(BackendError::CorruptMetadata(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn test_empty_metadata_does_not_serialize() {
        let meta = AttributeMetadata::default();
        assert!(meta.is_empty());
        assert!(matches!(meta.serialize(), Err(BackendError::InvalidParameter(_))));
    }

    #[test]
    fn test_conflict_ordering() {
        let base = AttributeMetadata::new(10, 2, "inv-b", "20230101000000.000", 5);

        let higher_version = AttributeMetadata::new(1, 3, "inv-a", "20000101000000.000", 1);
        assert!(higher_version.supersedes(&base));

        let later = AttributeMetadata::new(1, 2, "inv-a", "20230101000000.001", 1);
        assert!(later.supersedes(&base));

        let tie_break = AttributeMetadata::new(1, 2, "inv-c", "20230101000000.000", 1);
        assert!(tie_break.supersedes(&base));
        assert!(!base.supersedes(&tie_break));

        // local bookkeeping never decides a conflict
        let mut same = base.clone();
        same.set_local_usn(999);
        assert_eq!(same.resolve_conflict(&base), Ordering::Equal);
    }
}
