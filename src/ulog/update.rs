//! Update records stored in the update log

use bitflags::bitflags;

use crate::{
    codec::{marshal, Reader, Writer},
    error::{Error, Result},
    name::PrincipalName,
    principal::PrincipalEntry,
};

bitflags! {
    /// Principal fields carried by an update
    ///
    /// Lockout attributes are never replicated.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct UpdateMask: u32 {
        /// [`PrincipalEntry::attributes`]
        const Attributes = 0x0000_0001;
        /// [`PrincipalEntry::max_life`]
        const MaxLife = 0x0000_0002;
        /// [`PrincipalEntry::max_renewable_life`]
        const MaxRenewableLife = 0x0000_0004;
        /// [`PrincipalEntry::expiration`]
        const Expiration = 0x0000_0008;
        /// [`PrincipalEntry::pw_expiration`]
        const PwExpiration = 0x0000_0010;
        /// [`PrincipalEntry::key_data`]
        const KeyData = 0x0000_0020;
        /// [`PrincipalEntry::tl_data`]
        const TlData = 0x0000_0040;

        const _ = !0;
    }
}

/// Serial number and timestamp of an update
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct LastEntry {
    /// Serial number
    pub sno: u32,
    /// Seconds since the epoch
    pub seconds: u32,
    /// Microseconds
    pub useconds: u32,
}

impl LastEntry {
    /// Build from a serial number and a `(seconds, microseconds)` timestamp
    pub fn new(sno: u32, (seconds, useconds): (u32, u32)) -> Self {
        Self {
            sno,
            seconds,
            useconds,
        }
    }

    /// Whether both entries carry the same timestamp
    pub fn same_time(&self, other: &Self) -> bool {
        self.seconds == other.seconds && self.useconds == other.useconds
    }
}

/// A change to one principal
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct UpdateEntry {
    /// Serial number and timestamp, assigned when the update is logged
    pub stamp: LastEntry,
    /// Whether the update was completely written to the log
    pub committed: bool,
    /// Name of the changed principal
    pub name: PrincipalName,
    /// Whether the principal was deleted
    pub delete: bool,
    /// Fields of `payload` that changed
    pub mask: UpdateMask,
    /// Replicated fields of the new entry, empty for deletions
    pub payload: Vec<u8>,
}

fn differs(mask: UpdateMask, new: &PrincipalEntry, old: &PrincipalEntry) -> UpdateMask {
    let mut changed = UpdateMask::empty();
    changed.set(UpdateMask::Attributes, new.attributes != old.attributes);
    changed.set(UpdateMask::MaxLife, new.max_life != old.max_life);
    changed.set(
        UpdateMask::MaxRenewableLife,
        new.max_renewable_life != old.max_renewable_life,
    );
    changed.set(UpdateMask::Expiration, new.expiration != old.expiration);
    changed.set(UpdateMask::PwExpiration, new.pw_expiration != old.pw_expiration);
    changed.set(UpdateMask::KeyData, new.key_data != old.key_data);
    changed.set(UpdateMask::TlData, new.tl_data != old.tl_data);
    changed & mask
}

impl UpdateEntry {
    /// Update storing `entry`, over `previous` if the principal already exists
    pub fn put(entry: &PrincipalEntry, previous: Option<&PrincipalEntry>) -> Result<Self> {
        let mask = match previous {
            Some(previous) => differs(UpdateMask::all(), entry, previous),
            None => UpdateMask::all(),
        };
        Ok(Self {
            stamp: LastEntry::default(),
            committed: false,
            name: entry.name.clone(),
            delete: false,
            mask,
            payload: marshal::encode_principal(entry)?,
        })
    }

    /// Update deleting `name`
    pub fn delete(name: &PrincipalName) -> Self {
        Self {
            stamp: LastEntry::default(),
            committed: false,
            name: name.clone(),
            delete: true,
            mask: UpdateMask::empty(),
            payload: Vec::new(),
        }
    }

    /// Apply the masked fields of the payload over `existing`, or over an empty entry
    pub fn apply(&self, existing: Option<PrincipalEntry>) -> Result<PrincipalEntry> {
        let name = self.name.unparse();
        let new = marshal::decode_principal(name.as_bytes(), &self.payload)?;
        let Some(mut entry) = existing else {
            return Ok(new);
        };
        if self.mask.contains(UpdateMask::Attributes) {
            entry.attributes = new.attributes;
        }
        if self.mask.contains(UpdateMask::MaxLife) {
            entry.max_life = new.max_life;
        }
        if self.mask.contains(UpdateMask::MaxRenewableLife) {
            entry.max_renewable_life = new.max_renewable_life;
        }
        if self.mask.contains(UpdateMask::Expiration) {
            entry.expiration = new.expiration;
        }
        if self.mask.contains(UpdateMask::PwExpiration) {
            entry.pw_expiration = new.pw_expiration;
        }
        if self.mask.contains(UpdateMask::KeyData) {
            entry.key_data = new.key_data;
        }
        if self.mask.contains(UpdateMask::TlData) {
            entry.tl_data = new.tl_data;
        }
        Ok(entry)
    }

    /// Encode the update body, without serial number or commit flag
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let name = self.name.unparse();
        let payload_len: u32 = self
            .payload
            .len()
            .try_into()
            .map_err(|_| Error::UlogTooLarge)?;
        let mut writer = Writer::with_capacity(22 + name.len() + self.payload.len())?;
        writer.counted16(name.as_bytes())?;
        writer.u32(u32::from(self.delete));
        writer.u32(self.mask.bits());
        writer.u32(payload_len);
        writer.bytes(&self.payload);
        Ok(writer.finish())
    }

    /// Decode an update body
    pub(crate) fn decode(stamp: LastEntry, committed: bool, encoded: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(encoded);
        let name = String::from_utf8(reader.counted16()?.to_vec())?;
        let delete = reader.u32()? != 0;
        let mask = UpdateMask::from_bits_retain(reader.u32()?);
        let payload_len = reader.u32()? as usize;
        let payload = reader.bytes(payload_len)?.to_vec();
        Ok(Self {
            stamp,
            committed,
            name: PrincipalName::parse(&name, None)?,
            delete,
            mask,
            payload,
        })
    }
}
