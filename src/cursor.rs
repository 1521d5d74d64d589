use bitflags::bitflags;
use std::cell::Cell;
use std::ops::Bound;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::meta::{DupSet, Tree};
use crate::transaction::Transaction;
use crate::types::CursorOp;

/// A key/data pair borrowed from the transaction's snapshot
pub type Pair<'txn> = (&'txn [u8], &'txn [u8]);

bitflags! {
    /// Cursor state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CursorFlags: u32 {
        const INITIALIZED = 0x01;
        const EOF = 0x02;
    }
}

/// Database cursor
///
/// Positions are tracked as borrowed pairs, so a cursor never outlives the
/// transaction whose snapshot it walks. Positioning calls take `&self`.
pub struct Cursor<'txn> {
    /// Key space of the database at the transaction's snapshot
    tree: &'txn Tree,
    /// Database this cursor operates on
    db: Database,
    /// Current position
    current: Cell<Option<Pair<'txn>>>,
    flags: Cell<CursorFlags>,
}

impl<'txn> Cursor<'txn> {
    /// Create a new cursor
    pub fn new(txn: &'txn Transaction<'_>, db: &Database) -> Result<Self> {
        let tree = txn.tree(db.dbi)?;
        Ok(Cursor {
            tree,
            db: *db,
            current: Cell::new(None),
            flags: Cell::new(CursorFlags::empty()),
        })
    }

    pub fn database(&self) -> Database {
        self.db
    }

    /// Position at first key/data item
    pub fn first(&self) -> Result<Option<Pair<'txn>>> {
        let found = self
            .tree
            .iter()
            .next()
            .and_then(|(key, dups)| first_dup(key, dups));
        Ok(self.settle(found))
    }

    /// Position at last key/data item
    pub fn last(&self) -> Result<Option<Pair<'txn>>> {
        let found = self
            .tree
            .iter()
            .next_back()
            .and_then(|(key, dups)| last_dup(key, dups));
        Ok(self.settle(found))
    }

    /// Position at the first data item of `key`
    pub fn set(&self, key: &[u8]) -> Result<Option<Pair<'txn>>> {
        let found = self
            .tree
            .get_key_value(key)
            .and_then(|(key, dups)| first_dup(key, dups));
        Ok(self.settle(found))
    }

    /// Position at the first key greater than or equal to `key`
    pub fn set_range(&self, key: &[u8]) -> Result<Option<Pair<'txn>>> {
        let found = self
            .tree
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .and_then(|(key, dups)| first_dup(key, dups));
        Ok(self.settle(found))
    }

    /// Position at the exact key/data pair
    pub fn get_both(&self, key: &[u8], data: &[u8]) -> Result<Option<Pair<'txn>>> {
        let found = self.tree.get_key_value(key).and_then(|(key, dups)| {
            dups.get(data)
                .map(|data| (key.as_slice(), data.as_slice()))
        });
        Ok(self.settle(found))
    }

    /// Position at `key`, on the first data item greater than or equal to `data`
    pub fn get_both_range(&self, key: &[u8], data: &[u8]) -> Result<Option<Pair<'txn>>> {
        let found = self.tree.get_key_value(key).and_then(|(key, dups)| {
            dups.range::<[u8], _>((Bound::Included(data), Bound::Unbounded))
                .next()
                .map(|data| (key.as_slice(), data.as_slice()))
        });
        Ok(self.settle(found))
    }

    /// Return the pair at the cursor position
    pub fn get_current(&self) -> Result<Option<Pair<'txn>>> {
        if !self.flags.get().contains(CursorFlags::INITIALIZED) {
            return Err(Error::Invalid);
        }
        Ok(self.current.get())
    }

    /// Move to the next item, entering the next key after the last duplicate
    pub fn next(&self) -> Result<Option<Pair<'txn>>> {
        let Some((key, data)) = self.position()? else {
            return if self.at_eof() { Ok(None) } else { self.first() };
        };

        if let Some(found) = self.dup_after(key, data) {
            return Ok(self.settle(Some(found)));
        }
        self.next_nodup()
    }

    /// Move to the previous item, entering the previous key's last duplicate
    pub fn prev(&self) -> Result<Option<Pair<'txn>>> {
        let Some((key, data)) = self.position()? else {
            return if self.at_eof() { Ok(None) } else { self.last() };
        };

        if let Some(found) = self.dup_before(key, data) {
            return Ok(self.settle(Some(found)));
        }
        self.prev_nodup()
    }

    /// Move to the next duplicate of the current key, staying put at the end
    pub fn next_dup(&self) -> Result<Option<Pair<'txn>>> {
        let Some((key, data)) = self.position()? else {
            return Ok(None);
        };
        match self.dup_after(key, data) {
            Some(found) => Ok(self.settle(Some(found))),
            None => Ok(None),
        }
    }

    /// Move to the previous duplicate of the current key, staying put at the start
    pub fn prev_dup(&self) -> Result<Option<Pair<'txn>>> {
        let Some((key, data)) = self.position()? else {
            return Ok(None);
        };
        match self.dup_before(key, data) {
            Some(found) => Ok(self.settle(Some(found))),
            None => Ok(None),
        }
    }

    /// Move to the first item of the next key
    pub fn next_nodup(&self) -> Result<Option<Pair<'txn>>> {
        let Some((key, _)) = self.position()? else {
            return if self.at_eof() { Ok(None) } else { self.first() };
        };
        let found = self
            .tree
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .and_then(|(key, dups)| first_dup(key, dups));
        Ok(self.settle(found))
    }

    /// Move to the last item of the previous key
    pub fn prev_nodup(&self) -> Result<Option<Pair<'txn>>> {
        let Some((key, _)) = self.position()? else {
            return if self.at_eof() { Ok(None) } else { self.last() };
        };
        let found = self
            .tree
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .and_then(|(key, dups)| last_dup(key, dups));
        Ok(self.settle(found))
    }

    /// Move to the first duplicate of the current key
    pub fn first_dup(&self) -> Result<Option<Pair<'txn>>> {
        let Some((key, _)) = self.position()? else {
            return Ok(None);
        };
        let found = self
            .tree
            .get_key_value(key)
            .and_then(|(key, dups)| first_dup(key, dups));
        Ok(self.settle(found))
    }

    /// Move to the last duplicate of the current key
    pub fn last_dup(&self) -> Result<Option<Pair<'txn>>> {
        let Some((key, _)) = self.position()? else {
            return Ok(None);
        };
        let found = self
            .tree
            .get_key_value(key)
            .and_then(|(key, dups)| last_dup(key, dups));
        Ok(self.settle(found))
    }

    /// Number of duplicates stored under the current key
    pub fn count(&self) -> Result<usize> {
        let (key, _) = self.position()?.ok_or(Error::NotFound)?;
        Ok(self.tree.get(key).map_or(0, |dups| dups.len()))
    }

    /// Dispatch a positioning operation
    ///
    /// `key` is required by `Set`, `SetRange`, `GetBoth` and `GetBothRange`;
    /// `data` only by the two `GetBoth` variants.
    pub fn get(&self, op: CursorOp, key: Option<&[u8]>, data: Option<&[u8]>) -> Result<Option<Pair<'txn>>> {
        match op {
            CursorOp::First => self.first(),
            CursorOp::FirstDup => self.first_dup(),
            CursorOp::GetBoth => self.get_both(key.ok_or(Error::Invalid)?, data.ok_or(Error::Invalid)?),
            CursorOp::GetBothRange => {
                self.get_both_range(key.ok_or(Error::Invalid)?, data.ok_or(Error::Invalid)?)
            }
            CursorOp::GetCurrent => self.get_current(),
            CursorOp::Last => self.last(),
            CursorOp::LastDup => self.last_dup(),
            CursorOp::Next => self.next(),
            CursorOp::NextDup => self.next_dup(),
            CursorOp::NextNoDup => self.next_nodup(),
            CursorOp::Prev => self.prev(),
            CursorOp::PrevDup => self.prev_dup(),
            CursorOp::PrevNoDup => self.prev_nodup(),
            CursorOp::Set => self.set(key.ok_or(Error::Invalid)?),
            CursorOp::SetRange => self.set_range(key.ok_or(Error::Invalid)?),
        }
    }

    /// Iterate pairs from `start_key` (inclusive) up to `end_key` (exclusive)
    pub fn iter_range(&self, start_key: &[u8], end_key: &[u8]) -> Result<CursorIterator<'_, 'txn>> {
        let first = self.set_range(start_key)?;
        Ok(CursorIterator {
            cursor: self,
            pending: first,
            end_key: Some(end_key.to_vec()),
            dup_only: false,
        })
    }

    /// Iterate every data item stored under `key`
    pub fn iter_dup(&self, key: &[u8]) -> Result<CursorIterator<'_, 'txn>> {
        let first = self.set(key)?;
        Ok(CursorIterator {
            cursor: self,
            pending: first,
            end_key: None,
            dup_only: true,
        })
    }

    fn position(&self) -> Result<Option<Pair<'txn>>> {
        if !self.flags.get().contains(CursorFlags::INITIALIZED) {
            return Ok(None);
        }
        Ok(self.current.get())
    }

    fn at_eof(&self) -> bool {
        self.flags.get().contains(CursorFlags::EOF)
    }

    fn settle(&self, found: Option<Pair<'txn>>) -> Option<Pair<'txn>> {
        match found {
            Some(pair) => {
                self.current.set(Some(pair));
                self.flags.set(CursorFlags::INITIALIZED);
            }
            None => {
                self.current.set(None);
                self.flags.set(CursorFlags::EOF);
            }
        }
        found
    }

    fn dup_after(&self, key: &[u8], data: &[u8]) -> Option<Pair<'txn>> {
        let (key, dups) = self.tree.get_key_value(key)?;
        dups.range::<[u8], _>((Bound::Excluded(data), Bound::Unbounded))
            .next()
            .map(|data| (key.as_slice(), data.as_slice()))
    }

    fn dup_before(&self, key: &[u8], data: &[u8]) -> Option<Pair<'txn>> {
        let (key, dups) = self.tree.get_key_value(key)?;
        dups.range::<[u8], _>((Bound::Unbounded, Bound::Excluded(data)))
            .next_back()
            .map(|data| (key.as_slice(), data.as_slice()))
    }
}

fn first_dup<'a>(key: &'a [u8], dups: &'a DupSet) -> Option<Pair<'a>> {
    dups.iter().next().map(|data| (key, data.as_slice()))
}

fn last_dup<'a>(key: &'a [u8], dups: &'a DupSet) -> Option<Pair<'a>> {
    dups.iter().next_back().map(|data| (key, data.as_slice()))
}

/// Forward iterator over a cursor
pub struct CursorIterator<'c, 'txn> {
    cursor: &'c Cursor<'txn>,
    pending: Option<Pair<'txn>>,
    end_key: Option<Vec<u8>>,
    dup_only: bool,
}

impl<'c, 'txn> Iterator for CursorIterator<'c, 'txn> {
    type Item = Result<Pair<'txn>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, data) = self.pending.take()?;

        if let Some(end) = &self.end_key {
            if key >= end.as_slice() {
                return None;
            }
        }

        let step = if self.dup_only {
            self.cursor.next_dup()
        } else {
            self.cursor.next()
        };
        match step {
            Ok(next) => self.pending = next,
            Err(err) => return Some(Err(err)),
        }

        Some(Ok((key, data)))
    }
}
