use log::trace;
use std::sync::{Arc, MutexGuard};

use crate::constants::{DbFlags, TransactionFlags};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::meta::{DbSlot, Snapshot, Tree};

/// Database transaction
///
/// A write transaction owns the environment's writer lock for its whole
/// lifetime and mutates a private copy-on-write snapshot; `commit`
/// publishes it atomically, dropping it discards every change.
pub struct Transaction<'env> {
    /// Reference to environment
    env: &'env Environment,
    /// Transaction flags
    flags: TransactionFlags,
    /// Transaction ID
    txn_id: u64,
    /// Databases as seen by this transaction
    snapshot: Snapshot,
    /// Writer lock, `None` for read-only transactions
    _writer: Option<MutexGuard<'env, ()>>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txn_id", &self.txn_id)
            .field("flags", &self.flags)
            .field("dbs", &self.snapshot.dbs.len())
            .finish()
    }
}

impl<'env> Transaction<'env> {
    /// Create a new transaction
    pub(crate) fn new(env: &'env Environment, readonly: bool) -> Result<Self> {
        if !env.is_initialized() {
            return Err(Error::EnvNotInitialized);
        }

        if readonly {
            env.register_reader()?;
            let snapshot = (*env.committed_snapshot()).clone();
            trace!("begin read txn at {}", snapshot.txn_id);
            return Ok(Transaction {
                env,
                flags: TransactionFlags::RDONLY,
                txn_id: snapshot.txn_id,
                snapshot,
                _writer: None,
            });
        }

        if env.is_readonly() {
            return Err(Error::EnvReadOnly);
        }

        // Take the lock before reading the snapshot so no commit slips in between
        let writer = env.lock_writer();
        let snapshot = (*env.committed_snapshot()).clone();
        let txn_id = snapshot.txn_id + 1;
        trace!("begin write txn {}", txn_id);

        Ok(Transaction {
            env,
            flags: TransactionFlags::empty(),
            txn_id,
            snapshot,
            _writer: Some(writer),
        })
    }

    /// Commit the transaction
    pub fn commit(mut self) -> Result<()> {
        self.check_state()?;

        if self.is_readonly() || !self.flags.contains(TransactionFlags::DIRTY) {
            self.flags.insert(TransactionFlags::FINISHED);
            return Ok(());
        }

        let mut snapshot = std::mem::take(&mut self.snapshot);
        snapshot.txn_id = self.txn_id;

        match self.env.publish(snapshot) {
            Ok(()) => {
                self.flags.insert(TransactionFlags::FINISHED);
                trace!("committed txn {}", self.txn_id);
                Ok(())
            }
            Err(err) => {
                self.flags.insert(TransactionFlags::FINISHED | TransactionFlags::ERROR);
                Err(err)
            }
        }
    }

    /// Abort the transaction, discarding every change
    pub fn abort(mut self) {
        if !self.is_finished() {
            trace!("abort txn {}", self.txn_id);
        }
        self.flags.insert(TransactionFlags::FINISHED);
    }

    /// Get transaction ID
    pub fn id(&self) -> u64 {
        self.txn_id
    }

    /// Get reference to environment
    pub fn env(&self) -> &'env Environment {
        self.env
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(TransactionFlags::RDONLY)
    }

    pub fn is_finished(&self) -> bool {
        self.flags.contains(TransactionFlags::FINISHED)
    }

    fn check_state(&self) -> Result<()> {
        if self.is_finished() || self.flags.contains(TransactionFlags::ERROR) {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_state()?;
        if self.is_readonly() {
            return Err(Error::TxnReadOnly);
        }
        Ok(())
    }

    /// Look up a database by name
    pub(crate) fn find_db(&self, name: Option<&str>) -> Option<(u32, DbFlags)> {
        self.snapshot
            .find(name)
            .map(|(dbi, slot)| (dbi, slot.flags))
    }

    /// Add a named database to this transaction's snapshot
    pub(crate) fn create_db(&mut self, name: &str, flags: DbFlags) -> Result<u32> {
        self.check_writable()?;

        // the main database does not count against max_dbs
        if self.snapshot.dbs.len() > self.env.max_dbs as usize {
            return Err(Error::DbsFull);
        }

        let dbi = self.snapshot.dbs.len() as u32;
        self.snapshot
            .dbs
            .push(DbSlot::new(Some(name.to_string()), flags & DbFlags::DUPSORT));
        self.flags.insert(TransactionFlags::DIRTY);
        Ok(dbi)
    }

    /// Read access to a database's key space
    pub(crate) fn tree(&self, dbi: u32) -> Result<&Tree> {
        self.check_state()?;
        self.snapshot
            .dbs
            .get(dbi as usize)
            .map(|slot| slot.tree.as_ref())
            .ok_or(Error::BadDbi)
    }

    /// Write access to a database's key space, copying it on first touch
    pub(crate) fn tree_mut(&mut self, dbi: u32) -> Result<&mut Tree> {
        self.check_writable()?;
        let slot = self
            .snapshot
            .dbs
            .get_mut(dbi as usize)
            .ok_or(Error::BadDbi)?;
        self.flags.insert(TransactionFlags::DIRTY);
        Ok(Arc::make_mut(&mut slot.tree))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.is_finished() && !self.is_readonly() {
            trace!("txn {} dropped without commit", self.txn_id);
        }
        if self.is_readonly() {
            self.env.release_reader();
        }
    }
}
