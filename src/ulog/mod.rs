//! Update log for incremental propagation
//!
//! The log is a memory-mapped file: a header followed by a ring of fixed-size blocks, one per
//! update. The update with serial number `sno` lives in slot `(sno - 1) % entries`. The header
//! tracks the serial numbers and timestamps of the first and last updates still in the ring, so
//! that a replica can be told whether the updates it is missing are still available.
//!
//! Every change to the mapping is flushed before it is relied upon. A failed flush aborts the
//! process, since a replica could otherwise silently diverge.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use memmap2::MmapMut;

use crate::{
    backend::KdbBackend,
    conv::now_timeval,
    error::{Error, Result},
    lock::{flock, LockMode},
    params::{Params, DEFAULT_ULOG_ENTRIES, MAX_ULOG_ENTRIES},
};

mod update;

pub use update::{LastEntry, UpdateEntry, UpdateMask};

/// Unit of the block size of update slots
pub const ULOG_BLOCK: usize = 2048;
/// Maximum size of the log file
pub const MAX_LOG_LEN: usize = 0x1000_0000;

const HDR_MAGIC: u32 = 0x0666_2323;
const ENTRY_MAGIC: u32 = 0x0666_1212;
const DB_VERSION: u16 = 1;
const HEADER_SIZE: usize = 64;

const H_MAGIC: usize = 0;
const H_VERSION: usize = 4;
const H_STATE: usize = 6;
const H_NUM: usize = 8;
const H_FIRST: usize = 12;
const H_LAST: usize = 24;
const H_BLOCK: usize = 36;

const E_MAGIC: usize = 0;
const E_STAMP: usize = 4;
const E_COMMIT: usize = 16;
const E_SIZE: usize = 20;
const ENTRY_HEADER_SIZE: usize = 24;

/// State of the log, as stored in its header
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::EnumString, strum::FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u16)]
#[allow(clippy::exhaustive_enums)]
pub enum UlogState {
    /// Consistent
    Stable = 1,
    /// An update is being written
    Unstable = 2,
    /// Unusable
    Corrupt = 3,
}

/// Replication role of the process
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[allow(clippy::exhaustive_enums)]
pub enum IpropRole {
    /// Not replicating
    #[default]
    Null,
    /// Records updates for replicas
    Primary,
    /// Receives updates from a primary
    Replica,
}

/// Snapshot of the log header
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct UlogHeader {
    /// Format version
    pub db_version: u16,
    /// See [`UlogState`]
    pub state: UlogState,
    /// Number of updates in the ring
    pub num: u32,
    /// Oldest update in the ring
    pub first: LastEntry,
    /// Newest update
    pub last: LastEntry,
    /// Size of a slot, in bytes
    pub block: u16,
}

/// Answer to a replica asking for updates
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[allow(clippy::exhaustive_enums)]
pub enum UpdateStatus {
    /// Updates are returned
    Ok,
    /// The replica is up to date
    Nil,
    /// The updates the replica needs are gone, it must fetch the whole database
    FullResync,
}

/// Result of [`Ulog::get_entries`]
#[derive(Clone, Debug)]
#[allow(clippy::exhaustive_structs)]
pub struct UpdateResult {
    /// See [`UpdateStatus`]
    pub status: UpdateStatus,
    /// Newest update of the log
    pub last: LastEntry,
    /// Updates following the replica's last one, in order
    pub updates: Vec<UpdateEntry>,
}

/// An open update log
#[derive(Debug)]
pub struct Ulog {
    map: MmapMut,
    file: File,
    path: PathBuf,
    entries: u32,
    role: IpropRole,
}

impl Ulog {
    /// Open the log configured in `params`, as a primary
    pub fn from_params(params: &Params) -> Result<Self> {
        Self::open(
            &params.ulog_path(),
            params.iprop_ulogsize(),
            IpropRole::Primary,
        )
    }

    /// Open or create the log at `path` with a ring of `entries` slots
    ///
    /// A log whose contents don't fit `entries` is reset. A log with a foreign header fails with
    /// [`Error::UlogCorrupt`].
    pub fn open(path: &Path, entries: u32, role: IpropRole) -> Result<Self> {
        let entries = match entries {
            0 => DEFAULT_ULOG_ENTRIES,
            entries => entries.min(MAX_ULOG_ENTRIES),
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;
        if file.metadata()?.len() < HEADER_SIZE as u64 {
            file.set_len(HEADER_SIZE as u64)?;
        }
        // SAFETY: the file is only modified through mappings of it, by holders of its lock.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut ulog = Self {
            map,
            file,
            path: path.to_path_buf(),
            entries,
            role,
        };
        ulog.with_lock(LockMode::Exclusive, Self::map_check)?;
        log::debug!("opened update log {} ({entries} entries)", path.display());
        Ok(ulog)
    }

    /// Number of slots of the ring
    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Replication role of this process
    pub fn role(&self) -> IpropRole {
        self.role
    }

    /// Set the replication role of this process
    pub fn set_role(&mut self, role: IpropRole) {
        self.role = role;
    }

    /// Current header contents
    pub fn header(&self) -> UlogHeader {
        UlogHeader {
            db_version: self.get_u16(H_VERSION),
            state: UlogState::from_repr(self.get_u16(H_STATE)).unwrap_or(UlogState::Corrupt),
            num: self.get_u32(H_NUM),
            first: self.get_stamp(H_FIRST),
            last: self.get_stamp(H_LAST),
            block: self.get_u16(H_BLOCK),
        }
    }

    /// Serial number and timestamp of the newest update
    pub fn get_last(&mut self) -> Result<LastEntry> {
        self.with_lock(LockMode::Shared, |ulog| Ok(ulog.header().last))
    }

    /// Restart the log after a full resync, with a single placeholder for `last`
    pub fn set_last(&mut self, last: &LastEntry) -> Result<()> {
        self.with_lock(LockMode::Exclusive, |ulog| {
            ulog.reset_ulog();
            ulog.set_dummy(last);
            Ok(())
        })
    }

    /// Drop every update
    pub fn reset(&mut self) -> Result<()> {
        self.with_lock(LockMode::Exclusive, |ulog| {
            ulog.reset_ulog();
            Ok(())
        })
    }

    /// Append `update`, assigning its serial number and timestamp
    pub fn add_update(&mut self, update: &mut UpdateEntry) -> Result<()> {
        self.with_lock(LockMode::Exclusive, |ulog| {
            if ulog.header().last.sno == u32::MAX {
                log::warn!(
                    "serial numbers of {} are exhausted, restarting the log",
                    ulog.path.display()
                );
                ulog.reset_ulog();
                ulog.set_dummy(&LastEntry::new(1, now_timeval()));
            }
            update.stamp = LastEntry::new(ulog.header().last.sno + 1, now_timeval());
            update.committed = true;
            ulog.store_update(update)
        })
    }

    /// Updates following `last`, the newest update a replica has
    pub fn get_entries(&mut self, last: &LastEntry) -> Result<UpdateResult> {
        self.with_lock(LockMode::Shared, |ulog| {
            if ulog.get_u32(H_MAGIC) != HDR_MAGIC {
                return Err(Error::UlogCorrupt);
            }
            // A writer died mid-update
            if ulog.header().state != UlogState::Stable {
                flock(&ulog.file, Some(LockMode::Exclusive), true)?;
                log::warn!("{} is not stable, resetting", ulog.path.display());
                ulog.restart_ulog();
                return Ok(UpdateResult {
                    status: UpdateStatus::FullResync,
                    last: ulog.header().last,
                    updates: Vec::new(),
                });
            }
            let header = ulog.header();
            let status = ulog.sno_status(&header, last);
            let updates = match status {
                UpdateStatus::Ok => (last.sno..header.last.sno)
                    .map(|sno| ulog.read_slot(sno % ulog.entries, header.block))
                    .collect::<Result<Vec<_>>>()?,
                UpdateStatus::Nil | UpdateStatus::FullResync => Vec::new(),
            };
            Ok(UpdateResult {
                status,
                last: header.last,
                updates,
            })
        })
    }

    /// Apply updates received from a primary to `backend` and record them
    ///
    /// Uncommitted updates are skipped. An update that doesn't directly follow the newest local one
    /// resets the log first. On failure the log is reset, forcing a full resync.
    pub fn replay(&mut self, backend: &dyn KdbBackend, updates: &[UpdateEntry]) -> Result<()> {
        backend.lock(LockMode::Exclusive)?;
        let result = self.with_lock(LockMode::Exclusive, |ulog| {
            let result = ulog.apply_updates(backend, updates);
            if let Err(err) = &result {
                log::error!("replay failed, resetting {}: {err}", ulog.path.display());
                ulog.reset_ulog();
            }
            result
        });
        let unlocked = backend.unlock();
        result?;
        unlocked
    }

    fn apply_updates(&mut self, backend: &dyn KdbBackend, updates: &[UpdateEntry]) -> Result<()> {
        for update in updates.iter().filter(|update| update.committed) {
            let header = self.header();
            if header.num != 0 && update.stamp.sno != header.last.sno.wrapping_add(1) {
                log::warn!(
                    "update {} does not follow {}, resetting {}",
                    update.stamp.sno,
                    header.last.sno,
                    self.path.display()
                );
                self.reset_ulog();
            }

            if update.delete {
                match backend.delete_principal(&update.name) {
                    Ok(()) | Err(Error::NoEntry) => {}
                    Err(err) => return Err(err),
                }
            } else {
                let existing = match backend.get_principal(&update.name) {
                    Ok(entry) => Some(entry),
                    Err(Error::NoEntry) => None,
                    Err(err) => return Err(err),
                };
                backend.put_principal(&update.apply(existing)?)?;
            }
            self.store_update(update)?;
        }
        Ok(())
    }

    fn with_lock<R, F>(&mut self, mode: LockMode, f: F) -> Result<R>
    where
        F: FnOnce(&mut Self) -> Result<R>,
    {
        flock(&self.file, Some(mode), true)?;
        let result = self.remap().and_then(|()| f(self));
        let unlocked = flock(&self.file, None, true);
        let value = result?;
        unlocked?;
        Ok(value)
    }

    /// Validate the header of a freshly mapped log
    fn map_check(&mut self) -> Result<()> {
        match self.get_u32(H_MAGIC) {
            HDR_MAGIC => {}
            0 => {
                self.init_header(ULOG_BLOCK as u16);
                self.sync_header();
            }
            _ => return Err(Error::UlogCorrupt),
        }
        let header = self.header();
        if header.db_version != DB_VERSION {
            return Err(Error::UlogCorrupt);
        }
        self.ensure_size(usize::from(header.block))?;

        if header.num != 0
            && (header.num > self.entries
                || !self.check_sno(&header.first, header.block)
                || !self.check_sno(&header.last, header.block))
        {
            log::info!("{} does not match its configuration, resetting", self.path.display());
            self.restart_ulog();
        }
        Ok(())
    }

    /// Follow size changes made through other handles since the file was mapped
    ///
    /// Must be called with the file locked.
    fn remap(&mut self) -> Result<()> {
        let len = usize::try_from(self.file.metadata()?.len()).map_err(|_| Error::UlogTooLarge)?;
        if len != self.map.len() {
            log::debug!(
                "remapping {} ({} to {len} bytes)",
                self.path.display(),
                self.map.len()
            );
            // SAFETY: see `open`.
            self.map = unsafe { MmapMut::map_mut(&self.file)? };
        }
        if self.map.len() >= HEADER_SIZE && self.get_u32(H_MAGIC) == HDR_MAGIC {
            self.ensure_size(usize::from(self.header().block))?;
        }
        Ok(())
    }

    /// Grow the file to hold the ring with slots of `block` bytes
    fn ensure_size(&mut self, block: usize) -> Result<()> {
        let size = HEADER_SIZE + self.entries as usize * block;
        if self.map.len() < size {
            self.file.set_len(size as u64)?;
            // SAFETY: see `open`.
            self.map = unsafe { MmapMut::map_mut(&self.file)? };
        }
        Ok(())
    }

    fn sno_status(&self, header: &UlogHeader, last: &LastEntry) -> UpdateStatus {
        if last.sno == header.last.sno && last.same_time(&header.last) {
            return UpdateStatus::Nil;
        }
        if header.num == 0 || last.sno > header.last.sno || last.sno < header.first.sno {
            return UpdateStatus::FullResync;
        }
        // The serial number was reused since the replica saw it
        if !self.check_sno(last, header.block) {
            return UpdateStatus::FullResync;
        }
        UpdateStatus::Ok
    }

    /// Whether the slot of `stamp.sno` holds that update
    fn check_sno(&self, stamp: &LastEntry, block: u16) -> bool {
        let offset = self.slot_offset(stamp.sno.wrapping_sub(1) % self.entries, block);
        let stored = self.get_stamp(offset + E_STAMP);
        stored.sno == stamp.sno && stored.same_time(stamp)
    }

    fn read_slot(&self, index: u32, block: u16) -> Result<UpdateEntry> {
        let offset = self.slot_offset(index, block);
        if self.get_u32(offset + E_MAGIC) != ENTRY_MAGIC {
            return Err(Error::UlogCorrupt);
        }
        let size = self.get_u32(offset + E_SIZE) as usize;
        if size > usize::from(block) - ENTRY_HEADER_SIZE {
            return Err(Error::UlogCorrupt);
        }
        let data = offset + ENTRY_HEADER_SIZE;
        UpdateEntry::decode(
            self.get_stamp(offset + E_STAMP),
            self.get_u32(offset + E_COMMIT) != 0,
            &self.map[data..data + size],
        )
    }

    fn store_update(&mut self, update: &UpdateEntry) -> Result<()> {
        let body = update.encode()?;
        let recsize = ENTRY_HEADER_SIZE + body.len();
        let mut header = self.header();
        if recsize > usize::from(header.block) {
            self.resize(recsize)?;
            header = self.header();
        }
        let block = usize::from(header.block);

        header.state = UlogState::Unstable;
        self.write_header(&header);

        let offset = self.slot_offset(update.stamp.sno.wrapping_sub(1) % self.entries, header.block);
        self.map[offset..offset + block].fill(0);
        self.put_u32(offset + E_MAGIC, ENTRY_MAGIC);
        self.put_stamp(offset + E_STAMP, &update.stamp);
        self.put_u32(offset + E_COMMIT, 0);
        // Fits: body.len() < recsize <= block <= u16::MAX
        self.put_u32(offset + E_SIZE, body.len() as u32);
        let data = offset + ENTRY_HEADER_SIZE;
        self.map[data..data + body.len()].copy_from_slice(&body);
        self.put_u32(offset + E_COMMIT, 1);
        self.sync(offset, block);

        header.last = update.stamp;
        if header.num == 0 {
            header.num = 1;
            header.first = update.stamp;
        } else if header.num < self.entries {
            header.num += 1;
        } else {
            // The ring is full, the oldest update is the one after this slot
            let next = self.slot_offset(update.stamp.sno % self.entries, header.block);
            header.first = self.get_stamp(next + E_STAMP);
        }
        header.state = UlogState::Stable;
        self.write_header(&header);
        self.sync_header();
        Ok(())
    }

    /// Reinitialize the log with slots large enough for `recsize` bytes
    fn resize(&mut self, recsize: usize) -> Result<()> {
        let new_block = (recsize / ULOG_BLOCK + 1) * ULOG_BLOCK;
        let block: u16 = new_block.try_into().map_err(|_| Error::UlogTooLarge)?;
        if HEADER_SIZE + self.entries as usize * new_block > MAX_LOG_LEN {
            return Err(Error::UlogTooLarge);
        }
        log::info!(
            "resizing update log {} to {new_block} byte blocks",
            self.path.display()
        );
        self.init_header(block);
        self.sync_header();
        self.ensure_size(new_block)
    }

    /// Invalidate every slot and empty the header
    fn reset_ulog(&mut self) {
        let block = usize::from(self.header().block).max(ULOG_BLOCK);
        let end = self.map.len().min(HEADER_SIZE + self.entries as usize * block);
        if end > HEADER_SIZE {
            self.map[HEADER_SIZE..end].fill(0);
            self.sync(HEADER_SIZE, end - HEADER_SIZE);
        }
        self.init_header(ULOG_BLOCK as u16);
        self.sync_header();
        log::info!("reset update log {}", self.path.display());
    }

    /// Reset the log, keeping the newest serial number as a placeholder
    fn restart_ulog(&mut self) {
        let last = self.header().last;
        self.reset_ulog();
        if last.sno != 0 {
            self.set_dummy(&last);
        }
    }

    /// Make `stamp` the only update of an empty log, without contents
    fn set_dummy(&mut self, stamp: &LastEntry) {
        let mut header = self.header();
        let offset = self.slot_offset(stamp.sno.wrapping_sub(1) % self.entries, header.block);
        self.map[offset..offset + ENTRY_HEADER_SIZE].fill(0);
        self.put_u32(offset + E_MAGIC, ENTRY_MAGIC);
        self.put_stamp(offset + E_STAMP, stamp);
        self.sync(offset, ENTRY_HEADER_SIZE);

        header.num = 1;
        header.first = *stamp;
        header.last = *stamp;
        self.write_header(&header);
        self.sync_header();
    }

    fn init_header(&mut self, block: u16) {
        self.map[..HEADER_SIZE].fill(0);
        self.put_u32(H_MAGIC, HDR_MAGIC);
        self.write_header(&UlogHeader {
            db_version: DB_VERSION,
            state: UlogState::Stable,
            num: 0,
            first: LastEntry::default(),
            last: LastEntry::default(),
            block,
        });
    }

    fn write_header(&mut self, header: &UlogHeader) {
        self.put_u16(H_VERSION, header.db_version);
        self.put_u16(H_STATE, header.state as u16);
        self.put_u32(H_NUM, header.num);
        self.put_stamp(H_FIRST, &header.first);
        self.put_stamp(H_LAST, &header.last);
        self.put_u16(H_BLOCK, header.block);
    }

    fn slot_offset(&self, index: u32, block: u16) -> usize {
        HEADER_SIZE + index as usize * usize::from(block)
    }

    fn sync_header(&self) {
        self.sync(0, HEADER_SIZE);
    }

    fn sync(&self, offset: usize, len: usize) {
        if let Err(err) = self.map.flush_range(offset, len) {
            log::error!("failed to flush update log {}: {err}", self.path.display());
            std::process::abort();
        }
    }

    fn get_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.map[offset], self.map[offset + 1]])
    }

    fn get_u32(&self, offset: usize) -> u32 {
        let b = &self.map[offset..offset + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn get_stamp(&self, offset: usize) -> LastEntry {
        LastEntry {
            sno: self.get_u32(offset),
            seconds: self.get_u32(offset + 4),
            useconds: self.get_u32(offset + 8),
        }
    }

    fn put_u16(&mut self, offset: usize, value: u16) {
        self.map[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.map[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_stamp(&mut self, offset: usize, stamp: &LastEntry) {
        self.put_u32(offset, stamp.sno);
        self.put_u32(offset + 4, stamp.seconds);
        self.put_u32(offset + 8, stamp.useconds);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Seek, SeekFrom, Write},
        str::FromStr,
    };

    use super::*;
    use crate::{name::PrincipalName, principal::PrincipalEntry, tl_data::TlDataEntry};

    fn update(name: &str) -> UpdateEntry {
        let name = PrincipalName::parse(name, Some("EXAMPLE.COM")).unwrap();
        UpdateEntry::put(&PrincipalEntry::new(name), None).unwrap()
    }

    fn append(ulog: &mut Ulog, name: &str) -> Result<LastEntry> {
        let mut update = update(name);
        ulog.add_update(&mut update)?;
        Ok(update.stamp)
    }

    #[test]
    fn fresh_log() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("principal.ulog");
        let mut ulog = Ulog::open(&path, 10, IpropRole::Primary)?;
        let header = ulog.header();
        assert_eq!((header.state, header.num, header.block), (UlogState::Stable, 0, 2048));
        assert_eq!(std::fs::metadata(&path)?.len(), 64 + 10 * 2048);

        let stamp = append(&mut ulog, "alice")?;
        assert_eq!(stamp.sno, 1);
        let header = ulog.header();
        assert_eq!((header.num, header.first, header.last), (1, stamp, stamp));
        Ok(())
    }

    #[test]
    fn serial_exhaustion() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ulog = Ulog::open(&dir.path().join("ulog"), 10, IpropRole::Primary)?;
        ulog.set_last(&LastEntry::new(u32::MAX, (1, 0)))?;
        append(&mut ulog, "alice")?;
        let header = ulog.header();
        assert_eq!((header.num, header.first.sno, header.last.sno), (2, 1, 2));
        Ok(())
    }

    #[test]
    fn wraps_around() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ulog = Ulog::open(&dir.path().join("ulog"), 3, IpropRole::Primary)?;
        let stamps = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|name| append(&mut ulog, name))
            .collect::<Result<Vec<_>>>()?;
        let header = ulog.header();
        assert_eq!((header.num, header.first, header.last), (3, stamps[2], stamps[4]));

        let result = ulog.get_entries(&stamps[2])?;
        assert_eq!(result.status, UpdateStatus::Ok);
        let names: Vec<_> = result.updates.iter().map(|u| u.name.unparse()).collect();
        assert_eq!(names, ["d@EXAMPLE.COM", "e@EXAMPLE.COM"]);
        assert!(result.updates.iter().all(|u| u.committed));

        assert_eq!(ulog.get_entries(&stamps[0])?.status, UpdateStatus::FullResync);
        Ok(())
    }

    #[test]
    fn resync_detection() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ulog = Ulog::open(&dir.path().join("ulog"), 10, IpropRole::Primary)?;
        assert_eq!(
            ulog.get_entries(&LastEntry::new(1, (0, 0)))?.status,
            UpdateStatus::FullResync
        );
        let first = append(&mut ulog, "alice")?;
        let last = append(&mut ulog, "bob")?;

        let result = ulog.get_entries(&last)?;
        assert_eq!((result.status, result.updates.len()), (UpdateStatus::Nil, 0));
        assert_eq!(ulog.get_entries(&first)?.updates.len(), 1);

        let reused = LastEntry {
            useconds: first.useconds.wrapping_add(1),
            ..first
        };
        assert_eq!(ulog.get_entries(&reused)?.status, UpdateStatus::FullResync);
        assert_eq!(
            ulog.get_entries(&LastEntry::new(5, (0, 0)))?.status,
            UpdateStatus::FullResync
        );
        Ok(())
    }

    #[test]
    fn set_last_after_resync() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ulog = Ulog::open(&dir.path().join("ulog"), 10, IpropRole::Replica)?;
        append(&mut ulog, "alice")?;
        let last = LastEntry::new(42, (1_700_000_000, 5));
        ulog.set_last(&last)?;
        assert_eq!(ulog.get_last()?, last);
        let header = ulog.header();
        assert_eq!((header.num, header.first), (1, last));
        assert_eq!(ulog.get_entries(&last)?.status, UpdateStatus::Nil);
        Ok(())
    }

    #[test]
    fn grows_blocks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ulog");
        let mut ulog = Ulog::open(&path, 4, IpropRole::Primary)?;
        append(&mut ulog, "alice")?;

        let name = PrincipalName::parse("bob", Some("EXAMPLE.COM"))?;
        let mut entry = PrincipalEntry::new(name);
        entry.tl_data.entries.push(TlDataEntry {
            data_type: 0x7000,
            contents: vec![7; 3000],
        });
        let mut big = UpdateEntry::put(&entry, None)?;
        ulog.add_update(&mut big)?;
        assert_eq!(big.stamp.sno, 2);

        let header = ulog.header();
        assert_eq!((header.block, header.num, header.first.sno), (4096, 1, 2));
        assert_eq!(std::fs::metadata(&path)?.len(), 64 + 4 * 4096);
        Ok(())
    }

    #[test]
    fn reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ulog");
        let mut ulog = Ulog::open(&path, 10, IpropRole::Primary)?;
        for name in ["a", "b", "c"] {
            append(&mut ulog, name)?;
        }
        drop(ulog);

        assert_eq!(Ulog::open(&path, 10, IpropRole::Primary)?.header().num, 3);
        // Fewer slots than logged updates, serial numbers go on
        let mut ulog = Ulog::open(&path, 2, IpropRole::Primary)?;
        let header = ulog.header();
        assert_eq!((header.num, header.first.sno, header.last.sno), (1, 3, 3));
        assert_eq!(append(&mut ulog, "d")?.sno, 4);
        Ok(())
    }

    #[test]
    fn foreign_header() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ulog");
        std::fs::write(&path, [0xffu8; 128])?;
        assert!(matches!(
            Ulog::open(&path, 10, IpropRole::Primary),
            Err(Error::UlogCorrupt)
        ));
        Ok(())
    }

    #[test]
    fn unstable_log_is_reset() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ulog");
        let mut ulog = Ulog::open(&path, 10, IpropRole::Primary)?;
        let stamp = append(&mut ulog, "alice")?;

        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(H_STATE as u64))?;
        file.write_all(&(UlogState::Unstable as u16).to_le_bytes())?;
        file.sync_all()?;

        assert_eq!(ulog.get_entries(&stamp)?.status, UpdateStatus::FullResync);
        let header = ulog.header();
        assert_eq!((header.state, header.num, header.last), (UlogState::Stable, 1, stamp));
        Ok(())
    }

    #[test]
    fn follows_resize_by_other_handle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ulog");
        let mut a = Ulog::open(&path, 4, IpropRole::Primary)?;
        let mut b = Ulog::open(&path, 4, IpropRole::Primary)?;

        let name = PrincipalName::parse("big", Some("EXAMPLE.COM"))?;
        let mut entry = PrincipalEntry::new(name);
        entry.tl_data.entries.push(TlDataEntry {
            data_type: 0x7000,
            contents: vec![7; 3000],
        });
        let mut big = UpdateEntry::put(&entry, None)?;
        b.add_update(&mut big)?;
        for name in ["c", "d", "e"] {
            append(&mut b, name)?;
        }

        let result = a.get_entries(&big.stamp)?;
        assert_eq!(result.status, UpdateStatus::Ok);
        let names: Vec<_> = result.updates.iter().map(|u| u.name.unparse()).collect();
        assert_eq!(names, ["c@EXAMPLE.COM", "d@EXAMPLE.COM", "e@EXAMPLE.COM"]);
        assert_eq!(append(&mut a, "f")?.sno, 5);
        assert_eq!(a.header().block, 4096);
        Ok(())
    }

    #[test]
    fn textual_forms() -> anyhow::Result<()> {
        assert_eq!(IpropRole::from_str("replica")?, IpropRole::Replica);
        assert_eq!(UlogState::Unstable.to_string(), "unstable");
        Ok(())
    }
}
