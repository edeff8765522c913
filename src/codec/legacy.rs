//! Self-contained record format of the legacy backend
//!
//! Unlike [`super::marshal`], a principal record embeds its own name and the lockout
//! attributes, and policies embed their name.

use super::{
    marshal::{decode_policy, encode_policy, get_key_data, get_tl_data, put_key_data, put_tl_data},
    Reader, Writer, len16,
};
use crate::{
    error::{Error, Result},
    name::PrincipalName,
    policy::PolicyEntry,
    principal::{PrincipalAttributes, PrincipalEntry},
};

/// Length of the fixed part of a principal record, including the length field itself
const BASE_LENGTH: u16 = 38;

/// Encode a whole principal entry
pub fn encode_principal(entry: &PrincipalEntry) -> Result<Vec<u8>> {
    let mut name = entry.name.unparse().into_bytes();
    name.push(0);
    let capacity = usize::from(BASE_LENGTH)
        + 2
        + entry.e_data.len()
        + 2
        + name.len()
        + entry.tl_data.entries.iter().map(|tl| 4 + tl.contents.len()).sum::<usize>()
        + entry.key_data.iter().map(|kd| 12 + kd.key.contents.len()).sum::<usize>();
    let mut writer = Writer::with_capacity(capacity)?;
    writer.u16(BASE_LENGTH);
    writer.u32(entry.attributes.bits() as u32);
    writer.u32(entry.max_life);
    writer.u32(entry.max_renewable_life);
    writer.u32(entry.expiration);
    writer.u32(entry.pw_expiration);
    writer.u32(entry.last_success);
    writer.u32(entry.last_failed);
    writer.u32(entry.fail_auth_count);
    writer.u16(len16(entry.tl_data.entries.len())?);
    writer.u16(len16(entry.key_data.len())?);
    writer.counted16(&entry.e_data)?;
    writer.counted16(&name)?;
    put_tl_data(&mut writer, &entry.tl_data)?;
    put_key_data(&mut writer, &entry.key_data)?;
    Ok(writer.finish())
}

/// Decode a whole principal entry
pub fn decode_principal(encoded: &[u8]) -> Result<PrincipalEntry> {
    let mut reader = Reader::new(encoded);
    let base_length = reader.u16()?;
    if base_length < BASE_LENGTH {
        return Err(Error::TruncatedRecord);
    }
    let attributes = PrincipalAttributes::from_bits_retain(reader.u32()? as i32);
    let max_life = reader.u32()?;
    let max_renewable_life = reader.u32()?;
    let expiration = reader.u32()?;
    let pw_expiration = reader.u32()?;
    let last_success = reader.u32()?;
    let last_failed = reader.u32()?;
    let fail_auth_count = reader.u32()?;
    let n_tl_data = reader.u16()?;
    let n_key_data = reader.u16()?;
    // Newer writers may extend the fixed part
    reader.bytes(usize::from(base_length - BASE_LENGTH))?;
    let e_data = reader.counted16()?.to_vec();

    let name = reader.counted16()?;
    let name = name.strip_suffix(&[0]).unwrap_or(name);
    let name = String::from_utf8(name.to_vec())?;

    let mut entry = PrincipalEntry::new(PrincipalName::parse(&name, None)?);
    entry.attributes = attributes;
    entry.max_life = max_life;
    entry.max_renewable_life = max_renewable_life;
    entry.expiration = expiration;
    entry.pw_expiration = pw_expiration;
    entry.last_success = last_success;
    entry.last_failed = last_failed;
    entry.fail_auth_count = fail_auth_count;
    entry.e_data = e_data;
    entry.tl_data = get_tl_data(&mut reader, n_tl_data)?;
    entry.key_data = get_key_data(&mut reader, n_key_data)?;
    Ok(entry)
}

/// Encode a policy entry with its name
pub fn encode_policy_record(policy: &PolicyEntry) -> Result<Vec<u8>> {
    let body = encode_policy(policy)?;
    let mut writer = Writer::with_capacity(2 + policy.name.len() + body.len())?;
    writer.counted16(policy.name.as_bytes())?;
    writer.bytes(&body);
    Ok(writer.finish())
}

/// Decode a policy entry with its name
pub fn decode_policy_record(encoded: &[u8]) -> Result<PolicyEntry> {
    let mut reader = Reader::new(encoded);
    let name = reader.counted16()?;
    decode_policy(name, reader.rest())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        key_data::{KeyData, KeyDataBlock},
        EncryptionType,
    };

    #[test]
    fn carries_everything() -> Result<()> {
        let mut entry = PrincipalEntry::new("host/kdc@EXAMPLE.COM".parse()?);
        entry.last_success = 10;
        entry.last_failed = 20;
        entry.fail_auth_count = 2;
        entry.e_data = vec![1, 2, 3];
        entry.tl_data.set_last_admin_unlock(15);
        entry.key_data.push(KeyData {
            kvno: 4,
            key: KeyDataBlock {
                enctype: EncryptionType::AES256_CTS_HMAC_SHA1_96,
                contents: vec![9; 40],
            },
            salt: None,
        });
        let encoded = encode_principal(&entry)?;
        assert_eq!(decode_principal(&encoded)?, entry);
        assert!(matches!(
            decode_principal(&encoded[..encoded.len() - 3]),
            Err(Error::TruncatedRecord)
        ));
        Ok(())
    }

    #[test]
    fn policy_record() -> Result<()> {
        let policy = PolicyEntry::builder("default").max_fail(4).build()?;
        let encoded = encode_policy_record(&policy)?;
        assert_eq!(decode_policy_record(&encoded)?, policy);
        Ok(())
    }
}
