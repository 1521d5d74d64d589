//! Per-value replication metadata.
//!
//! Stored form:
//! `attr:localUsn:version:originInvoId:valueChangeOriginInvoId:valueChangeOriginTime:valueChangeOriginUsn:opCode:valueSize:value`
//!
//! The value is raw bytes and may itself contain `:` or NUL, so it is located
//! by skipping the nine leading fields and read by length, never by splitting.

use log::error;

use crate::constants::{ATTR_ATTR_VALUE_META_DATA, ORIG_TIME_STR_LEN};
use crate::error::{BackendError, BackendResult};
use crate::index_cfg::{IndexAccess, IndexCfgRegistry};
use crate::key::encode_attr_meta_key;
use crate::midl::ID;
use crate::transaction::Transaction;
use crate::log_bytes;

/// Number of delimited fields ahead of the value
const LEADING_FIELDS: usize = 9;

const DELIMITER: u8 = b':';

/// Operation that produced a value change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueOpCode {
    Add = 1,
    Delete = 2,
}

impl TryFrom<i64> for ValueOpCode {
    type Error = ();

    fn try_from(code: i64) -> Result<Self, ()> {
        match code {
            1 => Ok(ValueOpCode::Add),
            2 => Ok(ValueOpCode::Delete),
            _ => Err(()),
        }
    }
}

/// Replication metadata of one attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueAttributeMetadata {
    pub attr_type: String,
    pub local_usn: i64,
    pub version: u64,
    pub origin_invocation_id: String,
    pub value_change_origin_invocation_id: String,
    pub value_change_origin_time: String,
    pub value_change_origin_usn: i64,
    pub op_code: ValueOpCode,
    pub value: Vec<u8>,
}

impl ValueAttributeMetadata {
    pub fn serialize(&self) -> BackendResult<Vec<u8>> {
        let text_fields = [
            &self.attr_type,
            &self.origin_invocation_id,
            &self.value_change_origin_invocation_id,
            &self.value_change_origin_time,
        ];
        if text_fields
            .iter()
            .any(|field| field.is_empty() || field.as_bytes().contains(&DELIMITER))
        {
            return Err(BackendError::InvalidParameter(format!(
                "value metadata field missing or delimited for {}",
                self.attr_type
            )));
        }

        let head = format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:",
            self.attr_type,
            self.local_usn,
            self.version,
            self.origin_invocation_id,
            self.value_change_origin_invocation_id,
            self.value_change_origin_time,
            self.value_change_origin_usn,
            self.op_code as u8,
            self.value.len()
        );
        let mut out = Vec::with_capacity(head.len() + self.value.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&self.value);
        Ok(out)
    }

    pub fn deserialize(bytes: &[u8]) -> BackendResult<Self> {
        parse_record(bytes).ok_or_else(|| {
            error!("corrupt value metadata: {}", log_bytes(bytes));
            BackendError::CorruptMetadata(log_bytes(bytes))
        })
    }

    /// True when both records describe the same attribute value
    pub fn same_value(&self, other: &ValueAttributeMetadata) -> bool {
        self.value == other.value
    }

    /// True when this record's change is not newer than `other`'s
    pub fn is_not_newer_than(&self, other: &ValueAttributeMetadata) -> bool {
        time_prefix(&self.value_change_origin_time) <= time_prefix(&other.value_change_origin_time)
    }
}

fn parse_record(bytes: &[u8]) -> Option<ValueAttributeMetadata> {
    let (fields, value_start) = split_leading_fields(bytes)?;
    let mut text = fields.iter().map(|field| std::str::from_utf8(field).ok());
    let mut next = || text.next().flatten();

    let attr_type = next()?.to_string();
    let local_usn = next()?.parse().ok()?;
    let version = next()?.parse().ok()?;
    let origin_invocation_id = next()?.to_string();
    let value_change_origin_invocation_id = next()?.to_string();
    let value_change_origin_time = next()?.to_string();
    let value_change_origin_usn = next()?.parse().ok()?;
    let op_code = ValueOpCode::try_from(next()?.parse::<i64>().ok()?).ok()?;
    let value_size: usize = next()?.parse().ok()?;

    if bytes.len() - value_start != value_size {
        return None;
    }

    Some(ValueAttributeMetadata {
        attr_type,
        local_usn,
        version,
        origin_invocation_id,
        value_change_origin_invocation_id,
        value_change_origin_time,
        value_change_origin_usn,
        op_code,
        value: bytes[value_start..].to_vec(),
    })
}

fn time_prefix(time: &str) -> &str {
    time.get(..ORIG_TIME_STR_LEN).unwrap_or(time)
}

/// Split off the nine leading fields, returning them and the value offset
fn split_leading_fields(bytes: &[u8]) -> Option<([&[u8]; LEADING_FIELDS], usize)> {
    let empty: &[u8] = &[];
    let mut fields = [empty; LEADING_FIELDS];
    let mut start = 0;
    for field in fields.iter_mut() {
        let len = bytes[start..].iter().position(|b| *b == DELIMITER)?;
        *field = &bytes[start..start + len];
        start += len + 1;
    }
    Some((fields, start))
}

/// Sanity check of a stored record: the declared value size must account for
/// every byte after the ninth delimiter
pub fn is_valid_value_meta_entry(bytes: &[u8]) -> bool {
    let Some((fields, value_start)) = split_leading_fields(bytes) else {
        return false;
    };
    std::str::from_utf8(fields[LEADING_FIELDS - 1])
        .ok()
        .and_then(|size| size.parse::<usize>().ok())
        .map_or(false, |size| bytes.len() - value_start == size)
}

/// Stored value metadata records of one attribute
pub fn get_attr_value_metadata(
    txn: &Transaction<'_>,
    registry: &IndexCfgRegistry,
    entry_id: ID,
    attr_id: u16,
) -> BackendResult<Vec<ValueAttributeMetadata>> {
    let cfg = registry.acquire(ATTR_ATTR_VALUE_META_DATA, IndexAccess::Read)?;
    let key = encode_attr_meta_key(entry_id, attr_id);
    let cursor = cfg.db().cursor(txn)?;

    let mut records = Vec::new();
    for pair in cursor.iter_dup(&key)? {
        let (_, data) = pair?;
        records.push(ValueAttributeMetadata::deserialize(data)?);
    }
    Ok(records)
}
