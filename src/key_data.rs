//! Database [`KeyData`]

use crate::{EncryptionType, SaltType};

/// Encrypted key block as stored in the database
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDataBlock {
    /// Encryption type of the (cleartext) key
    pub enctype: EncryptionType,
    /// Key encrypted under a master key, prefixed by its cleartext length
    pub contents: Vec<u8>,
}

/// Salt associated with a key
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyDataSalt {
    /// Salt type
    pub salttype: SaltType,
    /// Explicit salt. Empty means the salt is derived from the principal name
    pub contents: Vec<u8>,
}

/// A single key version entry
///
/// Stored as key data version 1 when `salt` is `None`, version 2 otherwise.
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyData {
    /// Key version number
    pub kvno: u16,
    /// Key
    pub key: KeyDataBlock,
    /// Salt
    pub salt: Option<KeyDataSalt>,
}

impl KeyData {
    /// Key data format version
    pub fn version(&self) -> u16 {
        if self.salt.is_some() { 2 } else { 1 }
    }

    /// Encryption type of the key
    pub fn enctype(&self) -> EncryptionType {
        self.key.enctype
    }

    /// Salt type, `normal` for keys without salt information
    pub fn salttype(&self) -> SaltType {
        self.salt
            .as_ref()
            .map(|salt| salt.salttype)
            .unwrap_or_default()
    }
}

/// Sort key data by descending kvno, keeping the relative order of equal kvnos
pub(crate) fn sort_key_data(key_data: &mut [KeyData]) {
    key_data.sort_by(|a, b| b.kvno.cmp(&a.kvno));
}

/// Highest kvno in a key data list, 0 if empty
pub(crate) fn max_kvno(key_data: &[KeyData]) -> u16 {
    key_data.iter().map(|kd| kd.kvno).max().unwrap_or(0)
}
