//! Database [`TlData`]
//!
//! TL-data carry extensible typed metadata on principals and policies. Lookups return the first
//! entry of a given type.

use crate::{
    codec::{Reader, Writer, len16},
    error::{Error, Result},
    key_data::{KeyData, KeyDataBlock},
    EncryptionType,
};

/// Last password change timestamp
pub const KRB5_TL_LAST_PWD_CHANGE: u16 = 0x0001;
/// Last modification timestamp and modifier principal
pub const KRB5_TL_MOD_PRINC: u16 = 0x0002;
/// Administrative data, carries the policy reference
pub const KRB5_TL_KADM_DATA: u16 = 0x0003;
/// Master key version used to encrypt the keys of this entry
pub const KRB5_TL_MKVNO: u16 = 0x0008;
/// Master key activation list, only set on the master key principal
pub const KRB5_TL_ACTKVNO: u16 = 0x0009;
/// Master key auxiliary list, only set on the master key principal
pub const KRB5_TL_MKEY_AUX: u16 = 0x000a;
/// Timestamp of the last administrative unlock
pub const KRB5_TL_LAST_ADMIN_UNLOCK: u16 = 0x000b;
/// String attributes
pub const KRB5_TL_STRING_ATTRS: u16 = 0x000c;
/// Database arguments passed along with a principal, never stored
pub const KRB5_TL_DB_ARGS: u16 = 0x7fff;

/// Version tag of the [`KRB5_TL_ACTKVNO`] contents
const ACTKVNO_VERSION: u16 = 1;
/// Version tag of the [`KRB5_TL_MKEY_AUX`] contents
const MKEY_AUX_VERSION: u16 = 1;
/// Version tag of the [`KRB5_TL_KADM_DATA`] contents
const ADMIN_DATA_VERSION: u16 = 1;

/// A single TL-data entry
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlDataEntry {
    /// TL-data type
    pub data_type: u16,
    /// Entry contents
    pub contents: Vec<u8>,
}

/// TL-data entries
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct TlData {
    /// TL-data entries
    pub entries: Vec<TlDataEntry>,
}

/// One entry of the master key activation list
#[allow(clippy::exhaustive_structs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ActKvno {
    /// Master key version
    pub kvno: u16,
    /// When this master key becomes active
    pub act_time: u32,
}

/// Latest master key encrypted under an older master key
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MkeyAux {
    /// Version of the master key that encrypts `latest_mkey`
    pub mkey_kvno: u16,
    /// Latest master key, encrypted
    pub latest_mkey: KeyData,
}

/// Administrative data attached to a principal
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdminData {
    /// Name of the policy governing this principal
    pub policy: Option<String>,
    /// Auxiliary attributes
    pub aux_attributes: u32,
}

impl TlData {
    /// Contents of the first entry of `data_type`
    pub fn get(&self, data_type: u16) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|entry| entry.data_type == data_type)
            .map(|entry| entry.contents.as_slice())
    }

    /// Replace the first entry of `data_type`, or append one
    pub fn set(&mut self, data_type: u16, contents: Vec<u8>) {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.data_type == data_type)
        {
            Some(entry) => entry.contents = contents,
            None => self.entries.push(TlDataEntry {
                data_type,
                contents,
            }),
        }
    }

    /// Remove every entry of `data_type`
    pub fn remove(&mut self, data_type: u16) {
        self.entries.retain(|entry| entry.data_type != data_type);
    }

    fn get_u32(&self, data_type: u16) -> Result<u32> {
        match self.get(data_type) {
            Some(contents) => Reader::new(contents).u32(),
            None => Ok(0),
        }
    }

    /// Last password change, 0 if never recorded
    pub fn last_pwd_change(&self) -> Result<u32> {
        self.get_u32(KRB5_TL_LAST_PWD_CHANGE)
    }

    /// Record the last password change
    pub fn set_last_pwd_change(&mut self, stamp: u32) {
        self.set(KRB5_TL_LAST_PWD_CHANGE, stamp.to_le_bytes().to_vec());
    }

    /// Last administrative unlock, 0 if never unlocked
    pub fn last_admin_unlock(&self) -> Result<u32> {
        self.get_u32(KRB5_TL_LAST_ADMIN_UNLOCK)
    }

    /// Record an administrative unlock
    pub fn set_last_admin_unlock(&mut self, stamp: u32) {
        self.set(KRB5_TL_LAST_ADMIN_UNLOCK, stamp.to_le_bytes().to_vec());
    }

    /// Last modification time and modifier
    pub fn mod_princ(&self) -> Result<Option<(u32, String)>> {
        let Some(contents) = self.get(KRB5_TL_MOD_PRINC) else {
            return Ok(None);
        };
        let mut reader = Reader::new(contents);
        let stamp = reader.u32()?;
        let name = reader.rest();
        let name = name.strip_suffix(&[0]).unwrap_or(name);
        Ok(Some((stamp, String::from_utf8(name.to_vec())?)))
    }

    /// Record the last modification time and modifier
    pub fn set_mod_princ(&mut self, stamp: u32, modifier: &str) {
        let mut contents = stamp.to_le_bytes().to_vec();
        contents.extend_from_slice(modifier.as_bytes());
        contents.push(0);
        self.set(KRB5_TL_MOD_PRINC, contents);
    }

    /// Version of the master key protecting this entry's keys
    pub fn mkvno(&self) -> Result<Option<u16>> {
        self.get(KRB5_TL_MKVNO)
            .map(|contents| Reader::new(contents).u16())
            .transpose()
    }

    /// Record the master key version
    pub fn set_mkvno(&mut self, mkvno: u16) {
        self.set(KRB5_TL_MKVNO, mkvno.to_le_bytes().to_vec());
    }

    /// Master key activation list, sorted by activation time
    pub fn actkvno(&self) -> Result<Vec<ActKvno>> {
        let Some(contents) = self.get(KRB5_TL_ACTKVNO) else {
            return Ok(vec![]);
        };
        let mut reader = Reader::new(contents);
        let version = reader.u16()?;
        if version != ACTKVNO_VERSION {
            return Err(Error::BadVersion(version));
        }
        let mut list = Vec::with_capacity(reader.remaining() / 6);
        while reader.remaining() > 0 {
            list.push(ActKvno {
                kvno: reader.u16()?,
                act_time: reader.u32()?,
            });
        }
        Ok(list)
    }

    /// Replace the master key activation list
    pub fn set_actkvno(&mut self, list: &[ActKvno]) -> Result<()> {
        let mut writer = Writer::with_capacity(2 + list.len() * 6)?;
        writer.u16(ACTKVNO_VERSION);
        for entry in list {
            writer.u16(entry.kvno);
            writer.u32(entry.act_time);
        }
        self.set(KRB5_TL_ACTKVNO, writer.finish());
        Ok(())
    }

    /// Master key auxiliary list
    pub fn mkey_aux(&self) -> Result<Vec<MkeyAux>> {
        let Some(contents) = self.get(KRB5_TL_MKEY_AUX) else {
            return Ok(vec![]);
        };
        let mut reader = Reader::new(contents);
        let version = reader.u16()?;
        if version != MKEY_AUX_VERSION {
            return Err(Error::BadVersion(version));
        }
        let mut list = Vec::new();
        while reader.remaining() > 0 {
            let mkey_kvno = reader.u16()?;
            let kvno = reader.u16()?;
            let enctype = EncryptionType::from(i32::from(reader.u16()? as i16));
            let contents = reader.counted16()?.to_vec();
            list.push(MkeyAux {
                mkey_kvno,
                latest_mkey: KeyData {
                    kvno,
                    key: KeyDataBlock { enctype, contents },
                    salt: None,
                },
            });
        }
        Ok(list)
    }

    /// Replace the master key auxiliary list
    pub fn set_mkey_aux(&mut self, list: &[MkeyAux]) -> Result<()> {
        let size = list
            .iter()
            .map(|aux| 8 + aux.latest_mkey.key.contents.len())
            .sum::<usize>();
        let mut writer = Writer::with_capacity(2 + size)?;
        writer.u16(MKEY_AUX_VERSION);
        for aux in list {
            writer.u16(aux.mkey_kvno);
            writer.u16(aux.latest_mkey.kvno);
            writer.u16(i32::from(aux.latest_mkey.key.enctype) as u16);
            writer.counted16(&aux.latest_mkey.key.contents)?;
        }
        self.set(KRB5_TL_MKEY_AUX, writer.finish());
        Ok(())
    }

    /// Administrative data
    pub fn admin_data(&self) -> Result<AdminData> {
        let Some(contents) = self.get(KRB5_TL_KADM_DATA) else {
            return Ok(AdminData::default());
        };
        let mut reader = Reader::new(contents);
        let version = reader.u16()?;
        if version != ADMIN_DATA_VERSION {
            return Err(Error::BadVersion(version));
        }
        let aux_attributes = reader.u32()?;
        let policy = reader.counted16()?;
        let policy = if policy.is_empty() {
            None
        } else {
            Some(String::from_utf8(policy.to_vec())?)
        };
        Ok(AdminData {
            policy,
            aux_attributes,
        })
    }

    /// Replace the administrative data
    pub fn set_admin_data(&mut self, data: &AdminData) -> Result<()> {
        let policy = data.policy.as_deref().unwrap_or_default().as_bytes();
        let mut writer = Writer::with_capacity(8 + policy.len())?;
        writer.u16(ADMIN_DATA_VERSION);
        writer.u32(data.aux_attributes);
        writer.counted16(policy)?;
        self.set(KRB5_TL_KADM_DATA, writer.finish());
        Ok(())
    }

    /// Name of the policy referenced by this entry
    pub fn policy(&self) -> Result<Option<String>> {
        Ok(self.admin_data()?.policy)
    }

    /// String attributes, in insertion order
    pub fn string_attrs(&self) -> Result<Vec<(String, String)>> {
        let Some(contents) = self.get(KRB5_TL_STRING_ATTRS) else {
            return Ok(vec![]);
        };
        let mut parts = contents.split(|b| *b == 0);
        let mut attrs = Vec::new();
        while let Some(key) = parts.next() {
            if key.is_empty() {
                break;
            }
            let value = parts.next().ok_or(Error::TruncatedRecord)?;
            attrs.push((
                String::from_utf8(key.to_vec())?,
                String::from_utf8(value.to_vec())?,
            ));
        }
        Ok(attrs)
    }

    /// Set or, when `value` is `None`, remove a string attribute
    pub fn set_string_attr(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        let mut attrs = self.string_attrs()?;
        attrs.retain(|(k, _)| k != key);
        if let Some(value) = value {
            attrs.push((key.to_owned(), value.to_owned()));
        }
        if attrs.is_empty() {
            self.remove(KRB5_TL_STRING_ATTRS);
            return Ok(());
        }
        let mut contents = Vec::new();
        for (k, v) in attrs {
            contents.extend_from_slice(k.as_bytes());
            contents.push(0);
            contents.extend_from_slice(v.as_bytes());
            contents.push(0);
        }
        len16(contents.len())?;
        self.set(KRB5_TL_STRING_ATTRS, contents);
        Ok(())
    }
}
