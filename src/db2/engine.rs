//! Flat-file record engine
//!
//! A database file holds sorted `(key, value)` records after a header naming the file flavour.
//! Records are loaded in memory when a handle first locks the database and written back when
//! its last lock is released after a modification.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fs::OpenOptions,
    io::{self, Write},
    ops::Bound,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    codec::{Reader, Writer},
    error::{Error, Result},
    fs,
    lock::{LockFile, LockMode},
    params::suffixed,
};

const BTREE_MAGIC: u32 = 0x0005_3162;
const HASH_MAGIC: u32 = 0x0006_1561;
const FORMAT_VERSION: u32 = 1;

pub(super) type Records = BTreeMap<Vec<u8>, Vec<u8>>;

/// On-disk flavour of a database file
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub(super) enum DbKind {
    Btree,
    Hash,
}

impl DbKind {
    fn magic(self) -> u32 {
        match self {
            Self::Btree => BTREE_MAGIC,
            Self::Hash => HASH_MAGIC,
        }
    }

    fn other(self) -> Self {
        match self {
            Self::Btree => Self::Hash,
            Self::Hash => Self::Btree,
        }
    }
}

/// Read a database file, failing with [`Error::FileFormat`] if it isn't of flavour `kind`
pub(super) fn read_file(path: &Path, kind: DbKind) -> Result<Records> {
    let contents = std::fs::read(path)?;
    let mut reader = Reader::new(&contents);
    if reader.u32()? != kind.magic() {
        return Err(Error::FileFormat);
    }
    if reader.u32()? != FORMAT_VERSION {
        return Err(Error::FileFormat);
    }
    let count = reader.u32()?;
    let mut records = Records::new();
    for _ in 0..count {
        let klen = reader.u32()? as usize;
        let key = reader.bytes(klen)?.to_vec();
        let vlen = reader.u32()? as usize;
        let value = reader.bytes(vlen)?.to_vec();
        records.insert(key, value);
    }
    Ok(records)
}

/// Read a database file of either flavour, trying `first` before the other one
pub(super) fn probe_file(path: &Path, first: DbKind) -> Result<(DbKind, Records)> {
    match read_file(path, first) {
        Ok(records) => Ok((first, records)),
        Err(Error::FileFormat) => {
            let other = first.other();
            log::debug!("{} is not a {first} database, trying {other}", path.display());
            Ok((other, read_file(path, other)?))
        }
        Err(err) => Err(err),
    }
}

fn u32_len(len: usize) -> Result<u32> {
    len.try_into().map_err(|_| Error::FieldTooLong)
}

/// Replace a database file with `records`
pub(super) fn write_file(path: &Path, kind: DbKind, records: &Records) -> Result<()> {
    let size: usize = records.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
    let mut writer = Writer::with_capacity(12 + size)?;
    writer.u32(kind.magic());
    writer.u32(FORMAT_VERSION);
    writer.u32(u32_len(records.len())?);
    for (key, value) in records {
        writer.u32(u32_len(key.len())?);
        writer.bytes(key);
        writer.u32(u32_len(value.len())?);
        writer.bytes(value);
    }

    let tmp = suffixed(path, ".tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)?;
    file.write_all(&writer.finish())?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// A database file guarded by a lock file
///
/// Locking is counted per handle on top of the process-wide [`LockFile`].
pub(super) struct LockedDb {
    path: RefCell<PathBuf>,
    lock_path: RefCell<PathBuf>,
    lock: RefCell<Arc<LockFile>>,
    kind: Cell<DbKind>,
    depth: Cell<u32>,
    mode: Cell<Option<LockMode>>,
    records: RefCell<Option<Records>>,
    dirty: Cell<bool>,
}

impl LockedDb {
    pub(super) fn new(path: PathBuf, lock_path: PathBuf, kind: DbKind) -> Result<Self> {
        Ok(Self {
            lock: RefCell::new(LockFile::get(&lock_path)?),
            path: RefCell::new(path),
            lock_path: RefCell::new(lock_path),
            kind: Cell::new(kind),
            depth: Cell::new(0),
            mode: Cell::new(None),
            records: RefCell::new(None),
            dirty: Cell::new(false),
        })
    }

    pub(super) fn path(&self) -> PathBuf {
        self.path.borrow().clone()
    }

    pub(super) fn lock_path(&self) -> PathBuf {
        self.lock_path.borrow().clone()
    }

    /// Lock the database in `mode`, loading its records
    ///
    /// Records are reloaded when a weaker lock held by this handle is upgraded, as other handles
    /// may have written in the meantime.
    pub(super) fn lock(&self, mode: LockMode) -> Result<()> {
        let lock = self.lock.borrow().clone();
        lock.lock(mode)?;
        let upgrade = self.mode.get().is_some_and(|held| held < mode);
        if self.depth.get() == 0 || (upgrade && !self.dirty.get()) {
            match probe_file(&self.path.borrow(), self.kind.get()) {
                Ok((kind, records)) => {
                    self.kind.set(kind);
                    *self.records.borrow_mut() = Some(records);
                }
                Err(err) => {
                    lock.unlock()?;
                    return Err(err);
                }
            }
        }
        if self.mode.get() < Some(mode) {
            self.mode.set(Some(mode));
        }
        self.depth.set(self.depth.get() + 1);
        Ok(())
    }

    pub(super) fn unlock(&self) -> Result<()> {
        let depth = self.depth.get();
        if depth == 0 {
            return Err(Error::NotLocked);
        }
        self.depth.set(depth - 1);
        let flushed = if depth == 1 {
            let flushed = self.sync();
            *self.records.borrow_mut() = None;
            self.mode.set(None);
            flushed
        } else {
            Ok(())
        };
        let lock = self.lock.borrow().clone();
        lock.unlock()?;
        flushed
    }

    /// Write pending modifications back to the file
    pub(super) fn sync(&self) -> Result<()> {
        if !self.dirty.get() {
            return Ok(());
        }
        if let Some(records) = self.records.borrow().as_ref() {
            write_file(&self.path.borrow(), self.kind.get(), records)?;
            fs::touch(&self.lock_path.borrow())?;
        }
        self.dirty.set(false);
        Ok(())
    }

    /// Release every lock held by this handle without writing pending modifications
    pub(super) fn discard(&self) -> Result<()> {
        self.dirty.set(false);
        *self.records.borrow_mut() = None;
        self.mode.set(None);
        let lock = self.lock.borrow().clone();
        while self.depth.get() > 0 {
            self.depth.set(self.depth.get() - 1);
            lock.unlock()?;
        }
        Ok(())
    }

    /// Point this handle at another file, which must not be locked by it
    pub(super) fn retarget(&self, path: PathBuf, lock_path: PathBuf) -> Result<()> {
        if self.depth.get() > 0 {
            return Err(Error::CantLockDatabase);
        }
        *self.lock.borrow_mut() = LockFile::get(&lock_path)?;
        *self.path.borrow_mut() = path;
        *self.lock_path.borrow_mut() = lock_path;
        Ok(())
    }

    pub(super) fn depth(&self) -> u32 {
        self.depth.get()
    }

    /// Run `f` on the records under a shared lock
    pub(super) fn read<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Records) -> Result<R>,
    {
        self.lock(LockMode::Shared)?;
        let result = match self.records.borrow().as_ref() {
            Some(records) => f(records),
            None => Err(Error::DatabaseNotOpen),
        };
        let unlocked = self.unlock();
        let value = result?;
        unlocked?;
        Ok(value)
    }

    /// Run `f` on the records under an exclusive lock, marking them modified on success
    pub(super) fn write<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Records) -> Result<R>,
    {
        self.lock(LockMode::Exclusive)?;
        let result = match self.records.borrow_mut().as_mut() {
            Some(records) => f(records),
            None => Err(Error::DatabaseNotOpen),
        };
        if result.is_ok() {
            self.dirty.set(true);
        }
        let unlocked = self.unlock();
        let value = result?;
        unlocked?;
        Ok(value)
    }

    /// Copy of the record following `after` in key order, or preceding it with `reverse`
    ///
    /// Must be called with the database locked.
    pub(super) fn next_record(
        &self,
        after: Option<&[u8]>,
        reverse: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let records = self.records.borrow();
        let records = records.as_ref().ok_or(Error::DatabaseNotOpen)?;
        let item = match (after, reverse) {
            (None, false) => records.iter().next(),
            (None, true) => records.iter().next_back(),
            (Some(key), false) => records
                .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
                .next(),
            (Some(key), true) => records
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back(),
        };
        Ok(item.map(|(key, value)| (key.clone(), value.clone())))
    }
}

/// Create an empty database file, failing if it exists
pub(super) fn create_file(path: &Path, kind: DbKind) -> Result<()> {
    if path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("database {} already exists", path.display()),
        )
        .into());
    }
    write_file(path, kind, &Records::new())
}
