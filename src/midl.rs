use std::cmp::Ordering;

bitflags::bitflags! {
    /// Flags for IDL operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IdlFlags: u32 {
        const SORTED = 0b0000_0010;
    }
}

/// A directory entry id
pub type ID = u64;

// Size limits carried over from the C midl
const IDL_LOGN: usize = 16;
pub const IDL_DB_SIZE: usize = 1 << IDL_LOGN;
pub const IDL_DB_MAX: usize = IDL_DB_SIZE - 1;

/// ID List - a set of entry ids kept in ascending order.
///
/// Candidate scans append ids in index order, which for duplicate-sorted
/// index tables is already ascending; `sort` restores the invariant after
/// unordered appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IDL {
    ids: Vec<ID>,
    flags: IdlFlags,
}

impl IDL {
    /// Allocate a new empty IDL
    pub fn new() -> Self {
        IDL {
            ids: Vec::new(),
            flags: IdlFlags::SORTED,
        }
    }

    /// Allocate a new IDL with given capacity
    pub fn with_capacity(capacity: usize) -> Self {
        IDL {
            ids: Vec::with_capacity(capacity),
            flags: IdlFlags::SORTED,
        }
    }

    /// Get number of elements in the list
    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if the list is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Binary search for an ID.
    /// Returns the index where the ID is, or where it should be inserted
    pub fn search(&mut self, id: ID) -> usize {
        self.sort();
        match self.ids.binary_search(&id) {
            Ok(pos) | Err(pos) => pos,
        }
    }

    /// Insert an ID keeping the list sorted; false if already present
    pub fn insert(&mut self, id: ID) -> bool {
        let pos = self.search(id);
        if self.ids.get(pos) == Some(&id) {
            return false;
        }
        self.ids.insert(pos, id);
        true
    }

    /// Append an ID to the list
    pub fn append(&mut self, id: ID) {
        if let Some(last) = self.ids.last() {
            if *last >= id {
                self.flags.remove(IdlFlags::SORTED);
            }
        }
        self.ids.push(id);
    }

    /// Append a list of IDs
    pub fn append_list(&mut self, other: &IDL) {
        for id in &other.ids {
            self.append(*id);
        }
    }

    /// Sort the ID list in ascending order, dropping duplicates
    pub fn sort(&mut self) {
        if self.flags.contains(IdlFlags::SORTED) {
            return;
        }
        self.ids.sort_unstable();
        self.ids.dedup();
        self.flags.insert(IdlFlags::SORTED);
    }

    pub fn contains(&mut self, id: ID) -> bool {
        let pos = self.search(id);
        self.ids.get(pos) == Some(&id)
    }

    /// Ids present in either list
    pub fn union(mut self, mut other: IDL) -> IDL {
        self.sort();
        other.sort();

        let mut out = IDL::with_capacity(self.len() + other.len());
        let (mut a, mut b) = (self.ids.iter().peekable(), other.ids.iter().peekable());
        loop {
            let next = match (a.peek(), b.peek()) {
                (Some(x), Some(y)) => match x.cmp(y) {
                    Ordering::Less => a.next(),
                    Ordering::Greater => b.next(),
                    Ordering::Equal => {
                        b.next();
                        a.next()
                    }
                },
                (Some(_), None) => a.next(),
                (None, Some(_)) => b.next(),
                (None, None) => break,
            };
            if let Some(id) = next {
                out.ids.push(*id);
            }
        }
        out
    }

    /// Ids present in both lists
    pub fn intersection(mut self, mut other: IDL) -> IDL {
        self.sort();
        other.sort();

        let ids = self
            .ids
            .into_iter()
            .filter(|id| other.ids.binary_search(id).is_ok())
            .collect();
        IDL {
            ids,
            flags: IdlFlags::SORTED,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ID> {
        self.ids.iter()
    }

    pub fn as_slice(&self) -> &[ID] {
        &self.ids
    }

    /// Truncate the list to the scan limit; true if anything was dropped
    pub fn shrink(&mut self) -> bool {
        if self.ids.len() > IDL_DB_MAX {
            self.ids.truncate(IDL_DB_MAX);
            return true;
        }
        false
    }
}

impl Default for IDL {
    fn default() -> Self {
        IDL::new()
    }
}

impl FromIterator<ID> for IDL {
    fn from_iter<T: IntoIterator<Item = ID>>(iter: T) -> Self {
        let mut idl = IDL::new();
        for id in iter {
            idl.append(id);
        }
        idl.sort();
        idl
    }
}
