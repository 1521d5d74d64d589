use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::Arc;

use crate::constants::{DbFlags, MAIN_DB_NAME_LEN, MDB_MAGIC, MDB_VERSION};
use crate::error::{Error, Result};

/// Sorted duplicate values stored under one key
pub(crate) type DupSet = BTreeSet<Vec<u8>>;

/// Ordered key space of one database
pub(crate) type Tree = BTreeMap<Vec<u8>, DupSet>;

/// Data file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MetaHeader {
    /// Magic number identifying the file
    pub(crate) magic: u32,
    /// Version number
    pub(crate) version: u32,
    /// txnid that committed this image
    pub(crate) last_txn_id: u64,
    /// Number of database records that follow
    pub(crate) num_dbs: u32,
}

impl MetaHeader {
    pub(crate) const SIZE: usize = 4 + 4 + 8 + 4;

    fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(&self.magic.to_be_bytes())?;
        out.write_all(&self.version.to_be_bytes())?;
        out.write_all(&self.last_txn_id.to_be_bytes())?;
        out.write_all(&self.num_dbs.to_be_bytes())?;
        Ok(())
    }

    fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        let magic = reader.u32()?;
        if magic != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        let version = reader.u32()?;
        if version != MDB_VERSION {
            return Err(Error::VersionMismatch);
        }

        Ok(MetaHeader {
            magic,
            version,
            last_txn_id: reader.u64()?,
            num_dbs: reader.u32()?,
        })
    }
}

/// One database inside a snapshot
#[derive(Debug, Clone)]
pub(crate) struct DbSlot {
    /// `None` for the unnamed main database
    pub(crate) name: Option<String>,
    pub(crate) flags: DbFlags,
    /// Shared until a write transaction first touches it
    pub(crate) tree: Arc<Tree>,
}

impl DbSlot {
    pub(crate) fn new(name: Option<String>, flags: DbFlags) -> Self {
        DbSlot {
            name,
            flags,
            tree: Arc::new(Tree::new()),
        }
    }
}

/// Committed state of every database at one transaction id
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub(crate) txn_id: u64,
    pub(crate) dbs: Vec<DbSlot>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            txn_id: 0,
            dbs: vec![DbSlot::new(None, DbFlags::empty())],
        }
    }
}

impl Snapshot {
    /// Serialize the snapshot as a data file image
    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let header = MetaHeader {
            magic: MDB_MAGIC,
            version: MDB_VERSION,
            last_txn_id: self.txn_id,
            num_dbs: u32::try_from(self.dbs.len()).map_err(|_| Error::DbsFull)?,
        };
        header.write_to(out)?;

        for slot in &self.dbs {
            match &slot.name {
                Some(name) => {
                    let len = u16::try_from(name.len())
                        .ok()
                        .filter(|len| *len != MAIN_DB_NAME_LEN)
                        .ok_or(Error::BadValSize)?;
                    out.write_all(&len.to_be_bytes())?;
                    out.write_all(name.as_bytes())?;
                }
                None => out.write_all(&MAIN_DB_NAME_LEN.to_be_bytes())?,
            }
            out.write_all(&slot.flags.bits().to_be_bytes())?;
            out.write_all(&(slot.tree.len() as u64).to_be_bytes())?;

            for (key, dups) in slot.tree.iter() {
                write_chunk(out, key)?;
                out.write_all(&(dups.len() as u32).to_be_bytes())?;
                for data in dups {
                    write_chunk(out, data)?;
                }
            }
        }

        Ok(())
    }

    /// Decode a data file image
    pub(crate) fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let header = MetaHeader::read_from(&mut reader)?;

        let mut dbs = Vec::with_capacity(header.num_dbs as usize);
        for _ in 0..header.num_dbs {
            let name_len = reader.u16()?;
            let name = if name_len == MAIN_DB_NAME_LEN {
                None
            } else {
                let raw = reader.take(name_len as usize)?;
                Some(String::from_utf8(raw.to_vec()).map_err(|_| Error::Corrupted)?)
            };
            let flags = DbFlags::from_bits(reader.u32()?).ok_or(Error::Corrupted)?;

            let num_keys = reader.u64()?;
            let mut tree = Tree::new();
            for _ in 0..num_keys {
                let key = reader.chunk()?.to_vec();
                let num_dups = reader.u32()?;
                if num_dups == 0 {
                    return Err(Error::Corrupted);
                }
                let mut dups = DupSet::new();
                for _ in 0..num_dups {
                    dups.insert(reader.chunk()?.to_vec());
                }
                tree.insert(key, dups);
            }

            dbs.push(DbSlot {
                name,
                flags,
                tree: Arc::new(tree),
            });
        }

        if !reader.is_at_end() {
            return Err(Error::Corrupted);
        }
        // slot 0 is always the main database
        if dbs.first().map_or(true, |slot| slot.name.is_some()) {
            return Err(Error::Corrupted);
        }

        Ok(Snapshot {
            txn_id: header.last_txn_id,
            dbs,
        })
    }

    /// Find a named database
    pub(crate) fn find(&self, name: Option<&str>) -> Option<(u32, &DbSlot)> {
        self.dbs
            .iter()
            .enumerate()
            .find(|(_, slot)| slot.name.as_deref() == name)
            .map(|(dbi, slot)| (dbi as u32, slot))
    }
}

fn write_chunk<W: Write>(out: &mut W, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| Error::BadValSize)?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(bytes)?;
    Ok(())
}

/// Bounds-checked reader over a mapped data file
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::Corrupted)?;
        let out = self.bytes.get(self.pos..end).ok_or(Error::Corrupted)?;
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().map_err(|_| Error::Corrupted)?;
        Ok(u32::from_be_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let raw: [u8; 8] = self.take(8)?.try_into().map_err(|_| Error::Corrupted)?;
        Ok(u64::from_be_bytes(raw))
    }

    fn chunk(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn is_at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.txn_id = 7;

        let mut slot = DbSlot::new(Some("parentId".to_string()), DbFlags::DUPSORT);
        let tree = Arc::make_mut(&mut slot.tree);
        tree.entry(b"k1".to_vec()).or_default().insert(b"a".to_vec());
        tree.entry(b"k1".to_vec()).or_default().insert(b"b".to_vec());
        tree.entry(b"k2".to_vec()).or_default().insert(vec![0, b':', 0]);
        snapshot.dbs.push(slot);
        snapshot
    }

    #[test]
    fn test_snapshot_image_reload() {
        let snapshot = sample();
        let mut image = Vec::new();
        snapshot.write_to(&mut image).unwrap();

        let loaded = Snapshot::read_from(&image).unwrap();
        assert_eq!(loaded.txn_id, 7);
        assert_eq!(loaded.dbs.len(), 2);

        let (dbi, slot) = loaded.find(Some("parentId")).unwrap();
        assert_eq!(dbi, 1);
        assert_eq!(slot.flags, DbFlags::DUPSORT);
        assert_eq!(slot.tree.get(&b"k1"[..]).unwrap().len(), 2);
        assert!(slot.tree.get(&b"k2"[..]).unwrap().contains(&vec![0, b':', 0]));
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let mut image = Vec::new();
        sample().write_to(&mut image).unwrap();

        let mut bad_magic = image.clone();
        bad_magic[0] ^= 0xff;
        assert_eq!(Snapshot::read_from(&bad_magic).unwrap_err(), Error::Invalid);

        let mut bad_version = image.clone();
        bad_version[7] ^= 0x01;
        assert_eq!(
            Snapshot::read_from(&bad_version).unwrap_err(),
            Error::VersionMismatch
        );

        let truncated = &image[..image.len() - 1];
        assert_eq!(Snapshot::read_from(truncated).unwrap_err(), Error::Corrupted);

        let mut trailing = image;
        trailing.push(0);
        assert_eq!(Snapshot::read_from(&trailing).unwrap_err(), Error::Corrupted);
    }
}
