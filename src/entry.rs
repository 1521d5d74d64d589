//! In-memory directory entries and their stored encoding.

use crate::error::{BackendError, BackendResult, Error};
use crate::metadata::AttributeMetadata;
use crate::midl::ID;
use crate::value_metadata::ValueAttributeMetadata;

/// Leading byte of every encoded entry
const ENTRY_FORMAT_VERSION: u8 = 1;

/// One attribute of an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
    pub metadata: Option<AttributeMetadata>,
    pub value_metadata: Vec<ValueAttributeMetadata>,
}

impl Attribute {
    pub fn new(name: &str, values: Vec<Vec<u8>>) -> Self {
        Attribute {
            name: name.to_string(),
            values,
            metadata: None,
            value_metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: AttributeMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A directory entry
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    /// Zero until the entry is stored
    pub eid: ID,
    pub dn: String,
    pub attrs: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: &str) -> Self {
        Entry {
            eid: 0,
            dn: dn.to_string(),
            attrs: Vec::new(),
        }
    }

    /// Add values, merging into an existing attribute of the same name
    pub fn add_attribute(&mut self, name: &str, values: Vec<Vec<u8>>) {
        match self.find_attribute_mut(name) {
            Some(attr) => {
                for value in values {
                    if !attr.values.contains(&value) {
                        attr.values.push(value);
                    }
                }
            }
            None => self.attrs.push(Attribute::new(name, values)),
        }
    }

    pub fn with_attribute(mut self, name: &str, values: &[&[u8]]) -> Self {
        self.add_attribute(name, values.iter().map(|value| value.to_vec()).collect());
        self
    }

    pub fn find_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|attr| attr.is_named(name))
    }

    pub fn find_attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attrs.iter_mut().find(|attr| attr.is_named(name))
    }

    /// Replace an attribute wholesale, returning the previous one
    pub fn replace_attribute(&mut self, attr: Attribute) -> Option<Attribute> {
        match self.attrs.iter().position(|existing| existing.is_named(&attr.name)) {
            Some(pos) => Some(std::mem::replace(&mut self.attrs[pos], attr)),
            None => {
                self.attrs.push(attr);
                None
            }
        }
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        let pos = self.attrs.iter().position(|attr| attr.is_named(name))?;
        Some(self.attrs.remove(pos))
    }

    /// Encode for the entry table
    pub fn encode(&self) -> BackendResult<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.push(ENTRY_FORMAT_VERSION);
        out.extend_from_slice(&self.eid.to_be_bytes());
        put_chunk(&mut out, self.dn.as_bytes())?;
        put_count(&mut out, self.attrs.len())?;

        for attr in &self.attrs {
            put_chunk(&mut out, attr.name.as_bytes())?;
            let metadata = match &attr.metadata {
                Some(meta) => meta.serialize()?,
                None => String::new(),
            };
            put_chunk(&mut out, metadata.as_bytes())?;

            put_count(&mut out, attr.values.len())?;
            for value in &attr.values {
                put_chunk(&mut out, value)?;
            }

            put_count(&mut out, attr.value_metadata.len())?;
            for meta in &attr.value_metadata {
                put_chunk(&mut out, &meta.serialize()?)?;
            }
        }

        Ok(out)
    }

    /// Decode an entry table record
    pub fn decode(bytes: &[u8]) -> BackendResult<Entry> {
        let mut reader = Reader::new(bytes);
        let (eid, dn) = reader.header()?;

        let num_attrs = reader.u32()?;
        let mut attrs = Vec::with_capacity(num_attrs.min(64) as usize);
        for _ in 0..num_attrs {
            let name = reader.string()?;
            let metadata = match reader.string()? {
                text if text.is_empty() => None,
                text => Some(AttributeMetadata::deserialize(&text)?),
            };

            let num_values = reader.u32()?;
            let mut values = Vec::with_capacity(num_values.min(1024) as usize);
            for _ in 0..num_values {
                values.push(reader.chunk()?.to_vec());
            }

            let num_meta = reader.u32()?;
            let mut value_metadata = Vec::with_capacity(num_meta.min(1024) as usize);
            for _ in 0..num_meta {
                value_metadata.push(ValueAttributeMetadata::deserialize(reader.chunk()?)?);
            }

            attrs.push(Attribute {
                name,
                values,
                metadata,
                value_metadata,
            });
        }

        if !reader.is_at_end() {
            return Err(Error::Corrupted.into());
        }
        Ok(Entry { eid, dn, attrs })
    }

    /// Decode only the entry id and DN of a record
    pub fn decode_dn(bytes: &[u8]) -> BackendResult<(ID, String)> {
        Reader::new(bytes).header()
    }
}

fn put_count(out: &mut Vec<u8>, count: usize) -> BackendResult<()> {
    let count = u32::try_from(count).map_err(|_| Error::BadValSize)?;
    out.extend_from_slice(&count.to_be_bytes());
    Ok(())
}

fn put_chunk(out: &mut Vec<u8>, bytes: &[u8]) -> BackendResult<()> {
    put_count(out, bytes.len())?;
    out.extend_from_slice(bytes);
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> BackendResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::Corrupted)?;
        let out = self.bytes.get(self.pos..end).ok_or(Error::Corrupted)?;
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> BackendResult<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().map_err(|_| Error::Corrupted)?;
        Ok(u32::from_be_bytes(raw))
    }

    fn chunk(&mut self) -> BackendResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> BackendResult<String> {
        let raw = self.chunk()?;
        String::from_utf8(raw.to_vec()).map_err(|_| BackendError::Storage(Error::Corrupted))
    }

    fn header(&mut self) -> BackendResult<(ID, String)> {
        if self.take(1)? != [ENTRY_FORMAT_VERSION] {
            return Err(Error::VersionMismatch.into());
        }
        let raw: [u8; 8] = self.take(8)?.try_into().map_err(|_| Error::Corrupted)?;
        let eid = ID::from_be_bytes(raw);
        Ok((eid, self.string()?))
    }

    fn is_at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
