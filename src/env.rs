use lazy_static::lazy_static;
use log::{debug, trace, warn};
use memmap2::Mmap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::constants::{
    EnvFlags, DATA_FILE_NAME, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS, VERSION_MAJOR, VERSION_MINOR,
    VERSION_PATCH,
};
use crate::error::{Error, Result};
use crate::meta::{MetaHeader, Snapshot};
use crate::transaction::Transaction;
use crate::types::{EnvInfo, Stat};

lazy_static! {
    static ref CHANGEABLE: EnvFlags = EnvFlags::NOSYNC | EnvFlags::NOMETASYNC;
}

/// Storage environment: a set of named ordered databases sharing one
/// transaction space and one data file.
///
/// Writers are serialized through a single writer lock, and every
/// transaction works against an immutable committed snapshot; readers never
/// block writers.
#[derive(Debug)]
pub struct Environment {
    /// Path to the environment directory (or data file with `NOSUBDIR`)
    pub(crate) path: PathBuf,
    /// Environment flags
    pub(crate) flags: EnvFlags,
    /// Maximum number of named databases
    pub(crate) max_dbs: u32,
    /// Maximum number of readers
    pub(crate) max_readers: u32,
    /// Number of live read transactions
    pub(crate) num_readers: AtomicU32,
    /// Environment is initialized
    pub(crate) initialized: AtomicBool,
    /// Data file size at the last commit
    pub(crate) map_size: AtomicUsize,
    /// Last committed snapshot
    committed: RwLock<Arc<Snapshot>>,
    /// Held by the active write transaction
    writer: Mutex<()>,
}

impl Environment {
    /// Create a new environment
    pub fn new() -> Result<Self> {
        Ok(Environment {
            path: PathBuf::new(),
            flags: EnvFlags::empty(),
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
            num_readers: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            map_size: AtomicUsize::new(0),
            committed: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(()),
        })
    }

    /// Open the environment
    pub fn open<P: AsRef<Path>>(mut self, path: P, flags: EnvFlags) -> Result<Self> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(Error::EnvAlreadyOpen);
        }

        self.path = path.as_ref().to_path_buf();
        self.flags = flags;

        if !flags.contains(EnvFlags::NOSUBDIR) {
            if flags.contains(EnvFlags::RDONLY) {
                if !self.path.is_dir() {
                    return Err(Error::EnvInvalidPath);
                }
            } else {
                fs::create_dir_all(&self.path).map_err(|_| Error::EnvInvalidPath)?;
            }
        } else if self.path.is_dir() {
            return Err(Error::EnvInvalidPath);
        }

        let data_path = self.data_path();
        let snapshot = match File::open(&data_path) {
            Ok(file) => {
                let size = file.metadata()?.len() as usize;
                self.map_size.store(size, Ordering::SeqCst);
                if size == 0 {
                    Snapshot::default()
                } else {
                    Self::load(&file, size)?
                }
            }
            Err(_) if !flags.contains(EnvFlags::RDONLY) => Snapshot::default(),
            Err(_) => return Err(Error::EnvInvalidPath),
        };

        debug!(
            "opened environment {} at txn {} with {} databases",
            self.path.display(),
            snapshot.txn_id,
            snapshot.dbs.len()
        );

        self.committed = RwLock::new(Arc::new(snapshot));
        self.initialized.store(true, Ordering::SeqCst);
        Ok(self)
    }

    /// Map an existing data file and decode its image
    fn load(file: &File, size: usize) -> Result<Snapshot> {
        if size < MetaHeader::SIZE {
            return Err(Error::Invalid);
        }

        // Safety: the data file is only ever replaced by rename, never
        // modified in place, so the mapped bytes stay stable.
        let map = unsafe { Mmap::map(file)? };
        Snapshot::read_from(&map[..])
    }

    fn data_path(&self) -> PathBuf {
        if self.flags.contains(EnvFlags::NOSUBDIR) {
            self.path.clone()
        } else {
            self.path.join(DATA_FILE_NAME)
        }
    }

    /// Write a snapshot image next to `target` and move it into place
    fn write_image(snapshot: &Snapshot, target: &Path, sync: bool) -> Result<usize> {
        let mut tmp_name = target.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut out = BufWriter::new(file);
        snapshot.write_to(&mut out)?;
        out.flush()?;

        let file = out.into_inner().map_err(|_| Error::SyncFailed)?;
        if sync {
            file.sync_all().map_err(|_| Error::SyncFailed)?;
        }
        let size = file.metadata()?.len() as usize;
        drop(file);

        fs::rename(&tmp_path, target)?;
        Ok(size)
    }

    /// Copy environment to the specified directory
    ///
    /// This function may be used to make a backup of an existing environment.
    /// The copy reflects the last committed transaction.
    pub fn copy(&self, path: &Path) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::EnvNotInitialized);
        }

        // Validate destination path
        if path.exists() && !path.is_dir() {
            return Err(Error::EnvInvalidPath);
        }
        fs::create_dir_all(path).map_err(|_| Error::EnvInvalidPath)?;

        let snapshot = self.committed_snapshot();
        Self::write_image(&snapshot, &path.join(DATA_FILE_NAME), true)?;
        Ok(())
    }

    /// Flush the data file to disk
    ///
    /// Data is always written when transactions commit, but with `NOSYNC`
    /// the operating system may keep it buffered. This function forces
    /// the last committed image to stable storage.
    pub fn sync(&self, force: bool) -> Result<()> {
        if self.is_readonly() {
            return Err(Error::EnvReadOnly);
        }
        if !force && self.flags.contains(EnvFlags::NOSYNC) {
            return Ok(());
        }

        match File::open(self.data_path()) {
            Ok(file) => file.sync_all().map_err(|_| Error::SyncFailed),
            // nothing committed yet
            Err(_) => Ok(()),
        }
    }

    /// Set environment flags.
    ///
    /// Only `NOSYNC` and `NOMETASYNC` may be changed after open.
    pub fn set_flags(&mut self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::EnvNotInitialized);
        }
        if !CHANGEABLE.contains(flags) {
            return Err(Error::EnvFlagsImmutable);
        }

        if onoff {
            self.flags |= flags;
        } else {
            self.flags &= !flags;
        }
        Ok(())
    }

    /// Get environment flags.
    pub fn get_flags(&self) -> EnvFlags {
        self.flags
    }

    /// Get the path that was used in open()
    pub fn get_path(&self) -> Result<&Path> {
        if !self.is_initialized() {
            return Err(Error::EnvNotInitialized);
        }
        Ok(&self.path)
    }

    /// Set the maximum number of threads/reader slots
    pub fn set_max_readers(&mut self, readers: u32) -> Result<()> {
        if self.is_initialized() {
            return Err(Error::EnvAlreadyOpen);
        }
        self.max_readers = readers;
        Ok(())
    }

    pub fn get_max_readers(&self) -> u32 {
        self.max_readers
    }

    /// Set the maximum number of named databases
    ///
    /// This function must be called before opening the environment.
    pub fn set_max_dbs(&mut self, dbs: u32) -> Result<()> {
        if self.is_initialized() {
            return Err(Error::EnvAlreadyOpen);
        }
        self.max_dbs = dbs;
        Ok(())
    }

    pub fn get_max_dbs(&self) -> u32 {
        self.max_dbs
    }

    /// Begin a new write transaction, blocking while another one is active
    pub fn begin_txn(&self) -> Result<Transaction<'_>> {
        Transaction::new(self, false)
    }

    /// Begin a new read-only transaction
    pub fn begin_ro_txn(&self) -> Result<Transaction<'_>> {
        Transaction::new(self, true)
    }

    /// Get LMDB-compatible version
    pub fn version() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    /// Get version in String format
    pub fn version_string() -> String {
        format!("{}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    /// Statistics of the main (unnamed) database
    pub fn stat(&self) -> Result<Stat> {
        if !self.is_initialized() {
            return Err(Error::EnvNotInitialized);
        }
        let snapshot = self.committed_snapshot();
        let main = snapshot.dbs.first().ok_or(Error::Corrupted)?;
        Ok(Stat {
            keys: main.tree.len(),
            entries: main.tree.values().map(|dups| dups.len()).sum(),
        })
    }

    /// Get environment information
    pub fn info(&self) -> Result<EnvInfo> {
        if !self.is_initialized() {
            return Err(Error::EnvNotInitialized);
        }
        let snapshot = self.committed_snapshot();
        Ok(EnvInfo {
            mapsize: self.map_size.load(Ordering::SeqCst),
            last_txnid: snapshot.txn_id,
            max_readers: self.max_readers,
            num_readers: self.num_readers.load(Ordering::Relaxed),
            num_dbs: snapshot.dbs.len() as u32,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(EnvFlags::RDONLY)
    }

    pub(crate) fn committed_snapshot(&self) -> Arc<Snapshot> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take the writer lock; blocks while another write transaction is live
    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist and publish a write transaction's snapshot.
    ///
    /// Must be called with the writer lock held.
    pub(crate) fn publish(&self, snapshot: Snapshot) -> Result<()> {
        let sync = !self.flags.contains(EnvFlags::NOSYNC);
        let size = Self::write_image(&snapshot, &self.data_path(), sync).map_err(|err| {
            warn!("commit of txn {} failed: {}", snapshot.txn_id, err);
            err
        })?;
        self.map_size.store(size, Ordering::SeqCst);

        trace!("published txn {} ({} bytes)", snapshot.txn_id, size);
        *self.committed.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
        Ok(())
    }

    /// Register a reader
    pub(crate) fn register_reader(&self) -> Result<()> {
        let mut current = self.num_readers.load(Ordering::SeqCst);
        loop {
            if current >= self.max_readers {
                return Err(Error::ReadersFull);
            }
            match self.num_readers.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Release a reader slot
    pub(crate) fn release_reader(&self) {
        self.num_readers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_setters_before_open_only() {
        let dir = TempDir::new().unwrap();
        let mut env = Environment::new().unwrap();
        env.set_max_dbs(4).unwrap();
        env.set_max_readers(2).unwrap();

        let mut env = env.open(dir.path(), EnvFlags::empty()).unwrap();
        assert_eq!(env.get_max_dbs(), 4);
        assert_eq!(env.set_max_dbs(8), Err(Error::EnvAlreadyOpen));
        assert_eq!(
            env.set_flags(EnvFlags::RDONLY, true),
            Err(Error::EnvFlagsImmutable)
        );
        env.set_flags(EnvFlags::NOSYNC, true).unwrap();
        assert!(env.get_flags().contains(EnvFlags::NOSYNC));
    }

    #[test]
    fn test_reader_slots_are_bounded() {
        let dir = TempDir::new().unwrap();
        let mut env = Environment::new().unwrap();
        env.set_max_readers(1).unwrap();
        let env = env.open(dir.path(), EnvFlags::empty()).unwrap();

        let first = env.begin_ro_txn().unwrap();
        assert!(matches!(env.begin_ro_txn(), Err(Error::ReadersFull)));
        drop(first);
        assert!(env.begin_ro_txn().is_ok());
    }

    #[test]
    fn test_readonly_requires_existing_dir() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let result = Environment::new().unwrap().open(&missing, EnvFlags::RDONLY);
        assert!(matches!(result, Err(Error::EnvInvalidPath)));
    }
}
