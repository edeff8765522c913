//! Key/value record format
//!
//! Principal record:
//!
//! ```text
//! attributes:u32 max_life:u32 max_renewable_life:u32 expiration:u32 pw_expiration:u32
//! n_tl_data:u16 n_key_data:u16
//! n_tl_data * (type:u16 length:u16 contents)
//! n_key_data * (version:u16 kvno:u16 version * (type:u16 length:u16 contents))
//! ```
//!
//! The principal name is the storage key. The lockout attributes are a separate 12-byte record.

use super::{Reader, Writer, len16};
use crate::{
    error::{Error, Result},
    key_data::{KeyData, KeyDataBlock, KeyDataSalt},
    name::PrincipalName,
    policy::PolicyEntry,
    principal::{PrincipalAttributes, PrincipalEntry},
    tl_data::{TlData, TlDataEntry},
    EncryptionType, SaltType,
};

/// Size of an encoded lockout record
pub const LOCKOUT_RECORD_LEN: usize = 12;

fn tl_data_len(tl_data: &TlData) -> usize {
    tl_data.entries.iter().map(|tl| 4 + tl.contents.len()).sum()
}

fn key_data_len(key_data: &[KeyData]) -> usize {
    key_data
        .iter()
        .map(|kd| 8 + kd.key.contents.len() + kd.salt.as_ref().map_or(0, |s| 4 + s.contents.len()))
        .sum()
}

pub(crate) fn put_tl_data(writer: &mut Writer, tl_data: &TlData) -> Result<()> {
    for tl in &tl_data.entries {
        writer.u16(tl.data_type);
        writer.counted16(&tl.contents)?;
    }
    Ok(())
}

pub(crate) fn get_tl_data(reader: &mut Reader<'_>, count: u16) -> Result<TlData> {
    let mut entries = Vec::with_capacity(count.into());
    for _ in 0..count {
        let data_type = reader.u16()?;
        let contents = reader.counted16()?.to_vec();
        entries.push(TlDataEntry {
            data_type,
            contents,
        });
    }
    Ok(TlData { entries })
}

pub(crate) fn put_key_data(writer: &mut Writer, key_data: &[KeyData]) -> Result<()> {
    for kd in key_data {
        writer.u16(kd.version());
        writer.u16(kd.kvno);
        writer.u16(i32::from(kd.key.enctype) as u16);
        writer.counted16(&kd.key.contents)?;
        if let Some(salt) = &kd.salt {
            writer.u16(i32::from(salt.salttype) as u16);
            writer.counted16(&salt.contents)?;
        }
    }
    Ok(())
}

pub(crate) fn get_key_data(reader: &mut Reader<'_>, count: u16) -> Result<Vec<KeyData>> {
    let mut key_data = Vec::with_capacity(count.into());
    for _ in 0..count {
        let version = reader.u16()?;
        if !(1..=2).contains(&version) {
            return Err(Error::BadVersion(version));
        }
        let kvno = reader.u16()?;
        let enctype = EncryptionType::from(i32::from(reader.u16()? as i16));
        let contents = reader.counted16()?.to_vec();
        let salt = if version == 2 {
            let salttype = SaltType::from(i32::from(reader.u16()? as i16));
            let contents = reader.counted16()?.to_vec();
            Some(KeyDataSalt { salttype, contents })
        } else {
            None
        };
        key_data.push(KeyData {
            kvno,
            key: KeyDataBlock { enctype, contents },
            salt,
        });
    }
    Ok(key_data)
}

/// Encode the replicated part of a principal entry
pub fn encode_principal(entry: &PrincipalEntry) -> Result<Vec<u8>> {
    let n_tl_data = len16(entry.tl_data.entries.len())?;
    let n_key_data = len16(entry.key_data.len())?;
    let mut writer =
        Writer::with_capacity(24 + tl_data_len(&entry.tl_data) + key_data_len(&entry.key_data))?;
    writer.u32(entry.attributes.bits() as u32);
    writer.u32(entry.max_life);
    writer.u32(entry.max_renewable_life);
    writer.u32(entry.expiration);
    writer.u32(entry.pw_expiration);
    writer.u16(n_tl_data);
    writer.u16(n_key_data);
    put_tl_data(&mut writer, &entry.tl_data)?;
    put_key_data(&mut writer, &entry.key_data)?;
    Ok(writer.finish())
}

/// Decode a principal entry, taking its name from the storage key
///
/// Lockout attributes are left at zero.
pub fn decode_principal(key: &[u8], encoded: &[u8]) -> Result<PrincipalEntry> {
    let name = std::str::from_utf8(key)
        .map_err(|_| Error::BadPrincipalName(String::from_utf8_lossy(key).into_owned()))?;
    let mut entry = PrincipalEntry::new(PrincipalName::parse(name, None)?);

    let mut reader = Reader::new(encoded);
    entry.attributes = PrincipalAttributes::from_bits_retain(reader.u32()? as i32);
    entry.max_life = reader.u32()?;
    entry.max_renewable_life = reader.u32()?;
    entry.expiration = reader.u32()?;
    entry.pw_expiration = reader.u32()?;
    let n_tl_data = reader.u16()?;
    let n_key_data = reader.u16()?;
    entry.tl_data = get_tl_data(&mut reader, n_tl_data)?;
    entry.key_data = get_key_data(&mut reader, n_key_data)?;
    Ok(entry)
}

/// Encode a policy entry
pub fn encode_policy(policy: &PolicyEntry) -> Result<Vec<u8>> {
    let n_tl_data = len16(policy.tl_data.entries.len())?;
    let keysalts = policy.allowed_keysalts.as_deref().map(str::as_bytes);
    let mut writer = Writer::with_capacity(
        50 + keysalts.map_or(0, |ks| ks.len() + 1) + tl_data_len(&policy.tl_data),
    )?;
    for value in [
        policy.pw_min_life,
        policy.pw_max_life,
        policy.pw_min_length,
        policy.pw_min_classes,
        policy.pw_history_num,
        policy.pw_max_fail,
        policy.pw_failcnt_interval,
        policy.pw_lockout_duration,
        policy.attributes,
        policy.max_life,
        policy.max_renewable_life,
    ] {
        writer.u32(value);
    }
    match keysalts {
        Some(keysalts) => {
            let len = u32::try_from(keysalts.len() + 1).map_err(|_| Error::FieldTooLong)?;
            writer.u32(len);
            writer.bytes(keysalts);
            writer.bytes(&[0]);
        }
        None => writer.u32(0),
    }
    writer.u16(n_tl_data);
    put_tl_data(&mut writer, &policy.tl_data)?;
    Ok(writer.finish())
}

/// Decode a policy entry, taking its name from the storage key
pub fn decode_policy(key: &[u8], encoded: &[u8]) -> Result<PolicyEntry> {
    let mut reader = Reader::new(encoded);
    let mut policy = PolicyEntry {
        name: String::from_utf8(key.to_vec())?,
        pw_min_life: reader.u32()?,
        pw_max_life: reader.u32()?,
        pw_min_length: reader.u32()?,
        pw_min_classes: reader.u32()?,
        pw_history_num: reader.u32()?,
        pw_max_fail: reader.u32()?,
        pw_failcnt_interval: reader.u32()?,
        pw_lockout_duration: reader.u32()?,
        attributes: reader.u32()?,
        max_life: reader.u32()?,
        max_renewable_life: reader.u32()?,
        ..Default::default()
    };
    let len = reader.u32()?;
    if len > 0 {
        let keysalts = reader.bytes(len as usize)?;
        let keysalts = keysalts.strip_suffix(&[0]).unwrap_or(keysalts);
        policy.allowed_keysalts = Some(String::from_utf8(keysalts.to_vec())?);
    }
    let n_tl_data = reader.u16()?;
    policy.tl_data = get_tl_data(&mut reader, n_tl_data)?;
    Ok(policy)
}

/// Encode the non-replicated lockout attributes of an entry
pub fn encode_lockout(entry: &PrincipalEntry) -> [u8; LOCKOUT_RECORD_LEN] {
    let mut buf = [0; LOCKOUT_RECORD_LEN];
    buf[0..4].copy_from_slice(&entry.last_success.to_le_bytes());
    buf[4..8].copy_from_slice(&entry.last_failed.to_le_bytes());
    buf[8..12].copy_from_slice(&entry.fail_auth_count.to_le_bytes());
    buf
}

/// Decode lockout attributes into an entry
pub fn decode_lockout(encoded: &[u8], entry: &mut PrincipalEntry) -> Result<()> {
    let mut reader = Reader::new(encoded);
    entry.last_success = reader.u32()?;
    entry.last_failed = reader.u32()?;
    entry.fail_auth_count = reader.u32()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tl_data::KRB5_TL_LAST_ADMIN_UNLOCK;

    fn sample() -> Result<PrincipalEntry> {
        let mut entry = PrincipalEntry::new("alice@EXAMPLE.COM".parse()?);
        entry.attributes = PrincipalAttributes::RequiresPreAuth;
        entry.max_life = 36000;
        entry.max_renewable_life = 604_800;
        entry.expiration = 0x9000_0000;
        entry.tl_data.set(KRB5_TL_LAST_ADMIN_UNLOCK, vec![]);
        entry.tl_data.set_last_pwd_change(1_700_000_000);
        entry.key_data.push(KeyData {
            kvno: 2,
            key: KeyDataBlock {
                enctype: EncryptionType::AES256_CTS_HMAC_SHA1_96,
                contents: vec![0xaa; 34],
            },
            salt: Some(KeyDataSalt {
                salttype: SaltType::NORMAL,
                contents: vec![],
            }),
        });
        entry.key_data.push(KeyData {
            kvno: 1,
            key: KeyDataBlock {
                enctype: EncryptionType::AES128_CTS_HMAC_SHA1_96,
                contents: vec![],
            },
            salt: None,
        });
        Ok(entry)
    }

    #[test]
    fn principal_round_trip() -> Result<()> {
        let entry = sample()?;
        let encoded = encode_principal(&entry)?;
        let decoded = decode_principal(b"alice@EXAMPLE.COM", &encoded)?;
        assert_eq!(decoded, entry);
        Ok(())
    }

    #[test]
    fn principal_layout() -> Result<()> {
        let mut entry = PrincipalEntry::new("a@B".parse()?);
        entry.attributes = PrincipalAttributes::RequiresPreAuth;
        entry.tl_data.set(0x0102, vec![7]);
        let encoded = encode_principal(&entry)?;
        assert_eq!(
            encoded,
            vec![
                0x80, 0, 0, 0, // attributes
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // lifetimes and expirations
                1, 0, 0, 0, // counts
                2, 1, 1, 0, 7, // tl-data
            ]
        );
        Ok(())
    }

    #[test]
    fn name_comes_from_key() -> Result<()> {
        let encoded = encode_principal(&sample()?)?;
        let decoded = decode_principal(b"bob@EXAMPLE.COM", &encoded)?;
        assert_eq!(decoded.name.unparse(), "bob@EXAMPLE.COM");
        Ok(())
    }

    #[test]
    fn truncated_principal() -> Result<()> {
        let encoded = encode_principal(&sample()?)?;
        for len in [0, 10, 23, encoded.len() - 1] {
            assert!(matches!(
                decode_principal(b"alice@EXAMPLE.COM", &encoded[..len]),
                Err(Error::TruncatedRecord)
            ));
        }
        Ok(())
    }

    #[test]
    fn bad_key_data_version() -> Result<()> {
        let mut entry = PrincipalEntry::new("a@B".parse()?);
        entry.key_data.push(KeyData {
            kvno: 1,
            key: KeyDataBlock {
                enctype: EncryptionType::AES128_CTS_HMAC_SHA1_96,
                contents: vec![1],
            },
            salt: None,
        });
        let mut encoded = encode_principal(&entry)?;
        // key data version follows the 24-byte fixed part
        encoded[24] = 3;
        assert!(matches!(decode_principal(b"a@B", &encoded), Err(Error::BadVersion(3))));
        Ok(())
    }

    #[test]
    fn policy_round_trip() -> Result<()> {
        let mut policy = PolicyEntry::builder("strict")
            .max_fail(5)
            .allowed_keysalts(Some("aes256-cts:normal"))
            .build()?;
        policy.tl_data.set(0x0200, vec![]);
        let encoded = encode_policy(&policy)?;
        assert_eq!(decode_policy(b"strict", &encoded)?, policy);

        let bare = PolicyEntry::builder("bare").build()?;
        let encoded = encode_policy(&bare)?;
        assert_eq!(encoded.len(), 50);
        assert_eq!(decode_policy(b"bare", &encoded)?, bare);
        Ok(())
    }

    #[test]
    fn lockout_record() -> Result<()> {
        let mut entry = PrincipalEntry::new("a@B".parse()?);
        entry.last_success = 1;
        entry.last_failed = 0x0102_0304;
        entry.fail_auth_count = 3;
        let encoded = encode_lockout(&entry);
        assert_eq!(encoded, [1, 0, 0, 0, 4, 3, 2, 1, 3, 0, 0, 0]);

        let mut other = PrincipalEntry::new("a@B".parse()?);
        decode_lockout(&encoded, &mut other)?;
        assert!(!other.lockout_differs(&entry));
        assert!(matches!(
            decode_lockout(&encoded[..8], &mut other),
            Err(Error::TruncatedRecord)
        ));
        Ok(())
    }
}
