use std::collections::btree_map::Entry;

use crate::constants::{DbFlags, WriteFlags, MAX_KEY_SIZE};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::meta::DupSet;
use crate::transaction::Transaction;
use crate::types::Stat;

/// Database handle
///
/// A plain `(dbi, flags)` pair, valid in any transaction of the environment
/// that can see the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Database {
    /// Database identifier
    pub(crate) dbi: u32,
    /// Database flags
    pub(crate) flags: DbFlags,
}

impl Database {
    /// Open an existing database; `None` is the main database
    pub fn open(txn: &Transaction, name: Option<&str>) -> Result<Self> {
        let (dbi, flags) = txn.find_db(name).ok_or(Error::NotFound)?;
        Ok(Database { dbi, flags })
    }

    /// Open a named database, creating it if `flags` contains `CREATE`
    pub fn create(txn: &mut Transaction, name: &str, flags: DbFlags) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::BadValSize);
        }

        if let Some((dbi, existing)) = txn.find_db(Some(name)) {
            // DUPSORT is fixed at creation time
            if existing.contains(DbFlags::DUPSORT) != flags.contains(DbFlags::DUPSORT) {
                return Err(Error::Incompatible);
            }
            return Ok(Database {
                dbi,
                flags: existing,
            });
        }

        if !flags.contains(DbFlags::CREATE) {
            return Err(Error::NotFound);
        }

        let dbi = txn.create_db(name, flags)?;
        Ok(Database {
            dbi,
            flags: flags & DbFlags::DUPSORT,
        })
    }

    /// Get database flags
    pub fn flags(&self) -> DbFlags {
        self.flags
    }

    pub fn is_dupsort(&self) -> bool {
        self.flags.contains(DbFlags::DUPSORT)
    }

    /// Get database statistics
    pub fn stat(&self, txn: &Transaction) -> Result<Stat> {
        let tree = txn.tree(self.dbi)?;
        Ok(Stat {
            keys: tree.len(),
            entries: tree.values().map(|dups| dups.len()).sum(),
        })
    }

    /// Get the first value stored under `key`
    pub fn get<'t>(&self, txn: &'t Transaction, key: &[u8]) -> Result<Option<&'t [u8]>> {
        let tree = txn.tree(self.dbi)?;
        Ok(tree
            .get(key)
            .and_then(|dups| dups.iter().next())
            .map(|data| data.as_slice()))
    }

    /// Put a key/value pair
    ///
    /// `NOOVERWRITE` fails with `KeyExist` if the key is present at all;
    /// `NODUPDATA` fails with `KeyExist` if the exact pair is present. Without
    /// `DUPSORT` a put replaces the stored value.
    pub fn put(&self, txn: &mut Transaction, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(Error::BadValSize);
        }

        let dupsort = self.is_dupsort();
        let tree = txn.tree_mut(self.dbi)?;

        match tree.entry(key.to_vec()) {
            Entry::Occupied(mut slot) => {
                if flags.contains(WriteFlags::NOOVERWRITE) {
                    return Err(Error::KeyExist);
                }
                let dups = slot.get_mut();
                if dupsort {
                    if !dups.insert(data.to_vec()) && flags.contains(WriteFlags::NODUPDATA) {
                        return Err(Error::KeyExist);
                    }
                } else {
                    dups.clear();
                    dups.insert(data.to_vec());
                }
            }
            Entry::Vacant(slot) => {
                let mut dups = DupSet::new();
                dups.insert(data.to_vec());
                slot.insert(dups);
            }
        }

        Ok(())
    }

    /// Delete a key/value pair
    ///
    /// With `data` only the exact pair is removed; a key whose stored value
    /// differs is reported as `NotFound`, never deleted. Without `data` the
    /// key and all of its values are removed.
    pub fn del(&self, txn: &mut Transaction, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        let tree = txn.tree_mut(self.dbi)?;

        let Some(dups) = tree.get_mut(key) else {
            return Err(Error::NotFound);
        };

        match data {
            Some(data) => {
                if !dups.remove(data) {
                    return Err(Error::NotFound);
                }
                if dups.is_empty() {
                    tree.remove(key);
                }
            }
            None => {
                tree.remove(key);
            }
        }

        Ok(())
    }

    /// Remove every key from the database
    pub fn clear(&self, txn: &mut Transaction) -> Result<()> {
        txn.tree_mut(self.dbi)?.clear();
        Ok(())
    }

    /// Create a cursor for this database
    pub fn cursor<'t>(&self, txn: &'t Transaction) -> Result<Cursor<'t>> {
        Cursor::new(txn, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::EnvFlags;
    use crate::env::Environment;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Environment) {
        let dir = TempDir::new().unwrap();
        let env = Environment::new()
            .unwrap()
            .open(dir.path(), EnvFlags::NOSYNC)
            .unwrap();
        (dir, env)
    }

    #[test]
    fn test_dupsort_put_and_exact_delete() {
        let (_dir, env) = setup();
        let mut txn = env.begin_txn().unwrap();
        let db = Database::create(&mut txn, "dups", DbFlags::CREATE | DbFlags::DUPSORT).unwrap();

        db.put(&mut txn, b"k", b"2", WriteFlags::empty()).unwrap();
        db.put(&mut txn, b"k", b"1", WriteFlags::empty()).unwrap();
        // re-putting an existing pair is a no-op without NODUPDATA
        db.put(&mut txn, b"k", b"1", WriteFlags::empty()).unwrap();
        assert_eq!(
            db.put(&mut txn, b"k", b"1", WriteFlags::NODUPDATA),
            Err(Error::KeyExist)
        );
        assert_eq!(db.stat(&txn).unwrap().entries, 2);
        assert_eq!(db.get(&txn, b"k").unwrap(), Some(&b"1"[..]));

        assert_eq!(db.del(&mut txn, b"k", Some(b"3")), Err(Error::NotFound));
        db.del(&mut txn, b"k", Some(b"1")).unwrap();
        assert_eq!(db.get(&txn, b"k").unwrap(), Some(&b"2"[..]));
        db.del(&mut txn, b"k", Some(b"2")).unwrap();
        assert_eq!(db.get(&txn, b"k").unwrap(), None);
        assert_eq!(db.stat(&txn).unwrap().keys, 0);
    }

    #[test]
    fn test_plain_db_overwrite_and_mismatched_delete() {
        let (_dir, env) = setup();
        let mut txn = env.begin_txn().unwrap();
        let db = Database::create(&mut txn, "plain", DbFlags::CREATE).unwrap();

        db.put(&mut txn, b"k", b"a", WriteFlags::empty()).unwrap();
        db.put(&mut txn, b"k", b"b", WriteFlags::empty()).unwrap();
        assert_eq!(db.get(&txn, b"k").unwrap(), Some(&b"b"[..]));
        assert_eq!(
            db.put(&mut txn, b"k", b"c", WriteFlags::NOOVERWRITE),
            Err(Error::KeyExist)
        );

        assert_eq!(db.del(&mut txn, b"k", Some(b"a")), Err(Error::NotFound));
        assert_eq!(db.get(&txn, b"k").unwrap(), Some(&b"b"[..]));
        db.del(&mut txn, b"k", None).unwrap();
        assert_eq!(db.del(&mut txn, b"k", None), Err(Error::NotFound));
    }

    #[test]
    fn test_create_flag_mismatch_and_limits() {
        let dir = TempDir::new().unwrap();
        let mut env = Environment::new().unwrap();
        env.set_max_dbs(1).unwrap();
        let env = env.open(dir.path(), EnvFlags::NOSYNC).unwrap();

        let mut txn = env.begin_txn().unwrap();
        Database::create(&mut txn, "one", DbFlags::CREATE).unwrap();
        assert_eq!(
            Database::create(&mut txn, "one", DbFlags::CREATE | DbFlags::DUPSORT),
            Err(Error::Incompatible)
        );
        assert_eq!(
            Database::create(&mut txn, "two", DbFlags::CREATE),
            Err(Error::DbsFull)
        );
        assert_eq!(
            Database::create(&mut txn, "absent", DbFlags::empty()),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_key_size_limits() {
        let (_dir, env) = setup();
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        assert_eq!(db.put(&mut txn, b"", b"v", WriteFlags::empty()), Err(Error::BadValSize));
        let long = vec![b'x'; MAX_KEY_SIZE + 1];
        assert_eq!(db.put(&mut txn, &long, b"v", WriteFlags::empty()), Err(Error::BadValSize));
    }
}
