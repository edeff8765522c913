//! Binary encoding of database records
//!
//! All integers are little-endian. [`marshal`] is the key/value format used by the LMDB backend,
//! where the principal name lives in the storage key and the lockout attributes live in a
//! separate database. [`legacy`] is the self-contained format of the legacy backend.

pub mod legacy;
pub mod marshal;

use crate::error::{Error, Result};

/// Sequential reader over an encoded record
#[derive(Debug)]
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.buf.len() {
            return Err(Error::TruncatedRecord);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// A `u16` length followed by that many bytes
    pub(crate) fn counted16(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()?;
        self.bytes(len.into())
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

/// Record writer
///
/// The buffer is reserved up front with [`Vec::try_reserve`], so running out of memory
/// surfaces as [`Error::Allocation`].
#[derive(Debug)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn with_capacity(capacity: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve(capacity)?;
        Ok(Self { buf })
    }

    pub(crate) fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// A `u16` length followed by the bytes
    pub(crate) fn counted16(&mut self, bytes: &[u8]) -> Result<()> {
        self.u16(len16(bytes.len())?);
        self.bytes(bytes);
        Ok(())
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Length that must fit a `u16` prefix
pub(crate) fn len16(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::FieldTooLong)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_detects_truncation() {
        let mut reader = Reader::new(&[1, 0, 5, 0, 1, 2]);
        assert_eq!(reader.u16().ok(), Some(1));
        assert!(matches!(reader.counted16(), Err(Error::TruncatedRecord)));
    }

    #[test]
    fn writer_is_little_endian() -> Result<()> {
        let mut writer = Writer::with_capacity(6)?;
        writer.u32(0x0102_0304);
        writer.u16(0x0506);
        assert_eq!(writer.finish(), vec![4, 3, 2, 1, 6, 5]);
        Ok(())
    }
}
