//! Index key encodings.
//!
//! Every integer is big-endian so that byte order of keys matches numeric
//! order and range scans over entry ids walk them in ascending order.

use crate::constants::{ATTR_META_KEY_SEPARATOR, KEY_TYPE_FWD, KEY_TYPE_REV};
use crate::midl::ID;

/// Width of an encoded entry id
pub const ENTRY_ID_SIZE: usize = 8;

/// Width of an attribute metadata key
pub const ATTR_META_KEY_SIZE: usize = ENTRY_ID_SIZE + 1 + 2;

#[inline]
pub fn encode_entry_id(id: ID) -> [u8; ENTRY_ID_SIZE] {
    id.to_be_bytes()
}

/// Decode an entry id; `None` unless `bytes` is exactly eight bytes wide
pub fn decode_entry_id(bytes: &[u8]) -> Option<ID> {
    let raw: [u8; ENTRY_ID_SIZE] = bytes.try_into().ok()?;
    Some(ID::from_be_bytes(raw))
}

pub fn encode_forward_key(value: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + 1);
    key.push(KEY_TYPE_FWD);
    key.extend_from_slice(value);
    key
}

pub fn encode_reverse_key(value: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + 1);
    key.push(KEY_TYPE_REV);
    key.extend(value.iter().rev());
    key
}

/// Strip the type byte of a forward key
pub fn decode_forward_key(key: &[u8]) -> Option<&[u8]> {
    match key.split_first() {
        Some((&KEY_TYPE_FWD, value)) => Some(value),
        _ => None,
    }
}

/// Strip the type byte of a reverse key, leaving the value bytes still reversed
pub fn decode_reverse_key(key: &[u8]) -> Option<&[u8]> {
    match key.split_first() {
        Some((&KEY_TYPE_REV, reversed)) => Some(reversed),
        _ => None,
    }
}

pub fn encode_attr_meta_key(entry_id: ID, attr_id: u16) -> [u8; ATTR_META_KEY_SIZE] {
    let mut key = [0u8; ATTR_META_KEY_SIZE];
    key[..ENTRY_ID_SIZE].copy_from_slice(&encode_entry_id(entry_id));
    key[ENTRY_ID_SIZE] = ATTR_META_KEY_SEPARATOR;
    key[ENTRY_ID_SIZE + 1..].copy_from_slice(&attr_id.to_be_bytes());
    key
}

/// Prefix shared by every attribute metadata key of one entry
pub fn attr_meta_key_prefix(entry_id: ID) -> [u8; ENTRY_ID_SIZE + 1] {
    let mut prefix = [0u8; ENTRY_ID_SIZE + 1];
    prefix[..ENTRY_ID_SIZE].copy_from_slice(&encode_entry_id(entry_id));
    prefix[ENTRY_ID_SIZE] = ATTR_META_KEY_SEPARATOR;
    prefix
}

pub fn decode_attr_meta_key(key: &[u8]) -> Option<(ID, u16)> {
    if key.len() != ATTR_META_KEY_SIZE || key[ENTRY_ID_SIZE] != ATTR_META_KEY_SEPARATOR {
        return None;
    }
    let entry_id = decode_entry_id(&key[..ENTRY_ID_SIZE])?;
    let attr_id = u16::from_be_bytes([key[ENTRY_ID_SIZE + 1], key[ENTRY_ID_SIZE + 2]]);
    Some((entry_id, attr_id))
}
