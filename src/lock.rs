//! Advisory database locks
//!
//! Locks are `flock(2)` locks on a lock file next to the database. Within a process, every handle
//! on the same lock file shares one [`LockFile`], so that locking is reentrant: nested requests
//! for a mode already held only bump a counter, and the OS lock is released when the counter
//! drops back to zero.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io,
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock, Weak},
};

use crate::error::{Error, Result};

/// Database lock modes, ordered by strength
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[allow(clippy::exhaustive_enums)]
pub enum LockMode {
    /// Readers
    Shared,
    /// A single writer
    Exclusive,
    /// Exclusive lock that also removes the lock file, keeping other processes out until it is
    /// released
    Permanent,
}

/// Lock or unlock `file`, retrying on interruption
pub(crate) fn flock(file: &File, mode: Option<LockMode>, blocking: bool) -> io::Result<bool> {
    let mut operation = match mode {
        Some(LockMode::Shared) => libc::LOCK_SH,
        Some(LockMode::Exclusive | LockMode::Permanent) => libc::LOCK_EX,
        None => libc::LOCK_UN,
    };
    if !blocking {
        operation |= libc::LOCK_NB;
    }
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the duration of the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(false),
            _ => return Err(err),
        }
    }
}

/// Create `path` as an empty, owner-only file if it doesn't exist
pub(crate) fn create_lock_file(path: &Path) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?;
    Ok(())
}

#[derive(Debug, Default)]
struct LockState {
    file: Option<File>,
    mode: Option<LockMode>,
    count: u32,
}

/// A lock file shared by every handle of a process
#[derive(Debug)]
pub(crate) struct LockFile {
    path: PathBuf,
    state: Mutex<LockState>,
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<LockFile>>> {
    static LOCK_FILES: OnceLock<Mutex<HashMap<PathBuf, Weak<LockFile>>>> = OnceLock::new();
    LOCK_FILES.get_or_init(Default::default)
}

impl LockFile {
    /// The process-wide lock for `path`
    pub(crate) fn get(path: &Path) -> Result<Arc<Self>> {
        let mut files = registry().lock().map_err(|_| Error::LockError)?;
        files.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = files.get(path).and_then(Weak::upgrade) {
            return Ok(lock);
        }
        let lock = Arc::new(Self {
            path: path.to_path_buf(),
            state: Mutex::new(LockState::default()),
        });
        files.insert(path.to_path_buf(), Arc::downgrade(&lock));
        Ok(lock)
    }

    /// Acquire the lock in `mode`, upgrading a weaker held mode
    pub(crate) fn lock(&self, mode: LockMode) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::LockError)?;
        if state.count > 0 && state.mode >= Some(mode) {
            state.count += 1;
            return Ok(());
        }

        if state.file.is_none() {
            let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
                Ok(file) => file,
                Err(err) => {
                    log::debug!("can't open lock file {}: {err}", self.path.display());
                    return Err(Error::CantLockDatabase);
                }
            };
            state.file = Some(file);
        }
        let Some(file) = state.file.as_ref() else {
            return Err(Error::CantLockDatabase);
        };
        if let Err(err) = flock(file, Some(mode), true) {
            log::warn!("can't lock {} ({mode}): {err}", self.path.display());
            if state.count == 0 {
                state.file = None;
            }
            return Err(Error::CantLockDatabase);
        }

        if mode == LockMode::Permanent {
            if let Err(err) = std::fs::remove_file(&self.path) {
                log::warn!("can't remove lock file {}: {err}", self.path.display());
                // Go back to what was held before
                match state.mode.filter(|_| state.count > 0) {
                    Some(held) => {
                        if let Some(file) = state.file.as_ref() {
                            flock(file, Some(held), true).map_err(|_| Error::CantLockDatabase)?;
                        }
                    }
                    None => {
                        // Closing the file releases the lock
                        state.file = None;
                        state.mode = None;
                    }
                }
                return Err(Error::CantLockDatabase);
            }
        }
        log::trace!("locked {} ({mode})", self.path.display());
        state.mode = Some(mode);
        state.count += 1;
        Ok(())
    }

    /// Release one level of locking
    ///
    /// The OS lock is released with the last level even if the lock file of a permanent lock
    /// can't be restored, in which case [`Error::CantLockDatabase`] is returned.
    pub(crate) fn unlock(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::LockError)?;
        if state.count == 0 {
            return Err(Error::NotLocked);
        }
        state.count -= 1;
        if state.count > 0 {
            return Ok(());
        }

        let mut result = Ok(());
        if state.mode == Some(LockMode::Permanent) {
            if let Err(err) = create_lock_file(&self.path) {
                log::error!("can't restore lock file {}: {err}", self.path.display());
                result = Err(Error::CantLockDatabase);
            }
        }
        if let Some(file) = state.file.take() {
            if let Err(err) = flock(&file, None, true) {
                log::warn!("can't unlock {}: {err}", self.path.display());
                result = Err(Error::CantLockDatabase);
            }
        }
        log::trace!("unlocked {}", self.path.display());
        state.mode = None;
        result
    }

    /// Mode currently held by this process
    pub(crate) fn mode(&self) -> Result<Option<LockMode>> {
        let state = self.state.lock().map_err(|_| Error::LockError)?;
        Ok(state.mode)
    }
}
