//! File helpers shared by the backends

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    time::SystemTime,
};

use chrono::{DateTime, Utc};

use crate::error::Result;

const BLOCK: usize = 4096;

/// Overwrite the non-zero blocks of `path` with zeros, sync and unlink it
///
/// Missing files are ignored.
pub(crate) fn destroy_file(path: &Path) -> Result<()> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let zeros = [0u8; BLOCK];
    let mut buf = [0u8; BLOCK];
    let mut offset = 0u64;
    loop {
        let read = read_block(&mut file, &mut buf)?;
        if read == 0 {
            break;
        }
        if buf[..read].iter().any(|b| *b != 0) {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&zeros[..read])?;
        }
        offset += read as u64;
    }
    file.sync_all()?;
    drop(file);
    std::fs::remove_file(path)?;
    log::debug!("destroyed {}", path.display());
    Ok(())
}

fn read_block(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Unlink `path`, ignoring missing files
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

/// Modification time of `path`
pub(crate) fn mtime(path: &Path) -> Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(std::fs::metadata(path)?.modified()?))
}

/// Set the modification time of `path` to now, ignoring missing files
pub(crate) fn touch(path: &Path) -> Result<()> {
    match OpenOptions::new().write(true).open(path) {
        Ok(file) => Ok(file.set_modified(SystemTime::now())?),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
