//! Envelope encryption of key material under master keys
//!
//! Principal keys are stored encrypted under a master key. The stored contents are the
//! cleartext key length as a little-endian `u16`, followed by the ciphertext, so that padding
//! added by the cipher can be trimmed on decryption.

use std::fmt;

use zeroize::Zeroize;

use crate::{
    codec::len16,
    error::{Error, Result},
    key_data::{KeyData, KeyDataBlock, KeyDataSalt},
    tl_data::ActKvno,
    EncryptionType,
};

pub mod krb5;
pub mod soft;

pub use krb5::Krb5Crypto;
pub use soft::SoftCrypto;

/// Cleartext key, wiped from memory on drop
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, PartialEq, Eq)]
pub struct KeyBlock {
    /// Encryption type
    pub enctype: EncryptionType,
    /// Key bytes
    pub contents: Vec<u8>,
}

impl KeyBlock {
    /// Create a key block
    pub fn new(enctype: EncryptionType, contents: Vec<u8>) -> Self {
        Self { enctype, contents }
    }
}

impl fmt::Debug for KeyBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBlock")
            .field("enctype", &self.enctype)
            .field("length", &self.contents.len())
            .finish_non_exhaustive()
    }
}

impl Drop for KeyBlock {
    fn drop(&mut self) {
        self.contents.zeroize();
    }
}

/// Symmetric crypto provider
///
/// Encryption uses key usage 0, which is reserved for master key envelopes.
pub trait Crypto {
    /// Ciphertext length for a plaintext of `input_length` bytes
    fn encrypt_length(&self, enctype: EncryptionType, input_length: usize) -> Result<usize>;

    /// Encrypt `plaintext` with `key`
    fn encrypt(&self, key: &KeyBlock, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt `ciphertext` with `key`
    ///
    /// The result may be longer than the original plaintext.
    fn decrypt(&self, key: &KeyBlock, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Generate a random key
    fn make_random_key(&self, enctype: EncryptionType) -> Result<KeyBlock>;

    /// Derive a key from a password and a salt
    fn string_to_key(&self, enctype: EncryptionType, password: &[u8], salt: &[u8])
    -> Result<KeyBlock>;
}

/// A cleartext master key and its version
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterKey {
    /// Master key version number
    pub kvno: u32,
    /// Key
    pub key: KeyBlock,
}

/// Master keys known to a database context, newest first
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MasterKeyList {
    keys: Vec<MasterKey>,
}

impl MasterKeyList {
    /// Build a list, sorting keys by descending kvno
    pub fn new(mut keys: Vec<MasterKey>) -> Self {
        keys.sort_by(|a, b| b.kvno.cmp(&a.kvno));
        Self { keys }
    }

    /// Keys, newest first
    pub fn keys(&self) -> &[MasterKey] {
        &self.keys
    }

    /// Key with version `kvno`
    pub fn find(&self, kvno: u32) -> Option<&MasterKey> {
        self.keys.iter().find(|mk| mk.kvno == kvno)
    }

    /// Newest key
    pub fn newest(&self) -> Option<&MasterKey> {
        self.keys.first()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Encrypt a cleartext key under `mkey`
///
/// Version 2 key data is produced only for salts with a non-normal type.
pub fn encrypt_key_data(
    crypto: &dyn Crypto,
    mkey: &KeyBlock,
    key: &KeyBlock,
    salt: Option<&KeyDataSalt>,
    kvno: u16,
) -> Result<KeyData> {
    let length = len16(key.contents.len())?;
    let ciphertext = crypto.encrypt(mkey, &key.contents)?;
    let mut contents = Vec::new();
    contents.try_reserve(2 + ciphertext.len())?;
    contents.extend_from_slice(&length.to_le_bytes());
    contents.extend_from_slice(&ciphertext);

    Ok(KeyData {
        kvno,
        key: KeyDataBlock {
            enctype: key.enctype,
            contents,
        },
        salt: salt
            .filter(|salt| i32::from(salt.salttype) > 0)
            .cloned(),
    })
}

/// Decrypt key data with `mkey`, returning the cleartext key and its salt
///
/// Version 1 key data yield a `normal` salt with empty contents.
pub fn decrypt_key_data(
    crypto: &dyn Crypto,
    mkey: &KeyBlock,
    key_data: &KeyData,
) -> Result<(KeyBlock, KeyDataSalt)> {
    let salt = key_data.salt.clone().unwrap_or_default();
    let contents = &key_data.key.contents;
    if contents.is_empty() {
        return Ok((KeyBlock::new(key_data.key.enctype, vec![]), salt));
    }
    if contents.len() < 2 {
        return Err(Error::TruncatedRecord);
    }
    let declared = usize::from(u16::from_le_bytes([contents[0], contents[1]]));
    let mut plaintext = crypto.decrypt(mkey, &contents[2..])?;
    if declared > plaintext.len() {
        plaintext.zeroize();
        return Err(Error::BadStoredKey);
    }
    plaintext[declared..].zeroize();
    plaintext.truncate(declared);
    Ok((KeyBlock::new(key_data.key.enctype, plaintext), salt))
}

/// Decrypt key data with the first master key that works
///
/// Callers should reload the master key list once and retry before giving up.
pub fn decrypt_with_any_key(
    crypto: &dyn Crypto,
    mkeys: &MasterKeyList,
    key_data: &KeyData,
) -> Result<(KeyBlock, KeyDataSalt)> {
    for mkey in mkeys.keys() {
        match decrypt_key_data(crypto, &mkey.key, key_data) {
            Ok(decrypted) => return Ok(decrypted),
            Err(err) => log::debug!("master key {} does not decrypt key data: {err}", mkey.kvno),
        }
    }
    Err(Error::NoMatchingKey)
}

/// Master key version active at `now`
///
/// `list` must be sorted by ascending activation time. The active key is the last one activated
/// at or before `now`, or the first one if all of them are in the future.
pub fn find_active_master_key(list: &[ActKvno], now: u32) -> Option<u16> {
    let past = list.iter().take_while(|act| act.act_time <= now).count();
    if past == 0 {
        list.first().map(|act| act.kvno)
    } else {
        Some(list[past - 1].kvno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SaltType;

    fn mkey() -> KeyBlock {
        KeyBlock::new(EncryptionType::AES256_CTS_HMAC_SHA1_96, vec![0x11; 32])
    }

    #[test]
    fn envelope_round_trip() -> Result<()> {
        let crypto = SoftCrypto;
        let key = crypto.make_random_key(EncryptionType::AES128_CTS_HMAC_SHA1_96)?;
        let kd = encrypt_key_data(&crypto, &mkey(), &key, None, 3)?;
        assert_eq!(kd.version(), 1);
        assert_eq!(kd.kvno, 3);
        assert_eq!(&kd.key.contents[..2], &[16, 0]);

        let (decrypted, salt) = decrypt_key_data(&crypto, &mkey(), &kd)?;
        assert_eq!(decrypted, key);
        assert_eq!(salt.salttype, SaltType::NORMAL);
        assert!(salt.contents.is_empty());
        Ok(())
    }

    #[test]
    fn explicit_salt_makes_version_2() -> Result<()> {
        let crypto = SoftCrypto;
        let key = crypto.make_random_key(EncryptionType::AES256_CTS_HMAC_SHA1_96)?;
        let normal = KeyDataSalt::default();
        assert_eq!(encrypt_key_data(&crypto, &mkey(), &key, Some(&normal), 1)?.version(), 1);

        let special = KeyDataSalt {
            salttype: SaltType::SPECIAL,
            contents: b"EXAMPLE.COMalice".to_vec(),
        };
        let kd = encrypt_key_data(&crypto, &mkey(), &key, Some(&special), 1)?;
        assert_eq!(kd.version(), 2);
        let (_, salt) = decrypt_key_data(&crypto, &mkey(), &kd)?;
        assert_eq!(salt, special);
        Ok(())
    }

    #[test]
    fn overlong_declared_length() -> Result<()> {
        let crypto = SoftCrypto;
        let key = crypto.make_random_key(EncryptionType::AES128_CTS_HMAC_SHA1_96)?;
        let mut kd = encrypt_key_data(&crypto, &mkey(), &key, None, 1)?;
        kd.key.contents[0] = 0xff;
        assert!(matches!(
            decrypt_key_data(&crypto, &mkey(), &kd),
            Err(Error::BadStoredKey)
        ));
        Ok(())
    }

    #[test]
    fn any_key() -> Result<()> {
        let crypto = SoftCrypto;
        let old = MasterKey {
            kvno: 1,
            key: mkey(),
        };
        let new = MasterKey {
            kvno: 2,
            key: crypto.make_random_key(EncryptionType::AES256_CTS_HMAC_SHA1_96)?,
        };
        let key = crypto.make_random_key(EncryptionType::AES256_CTS_HMAC_SHA1_96)?;
        let kd = encrypt_key_data(&crypto, &old.key, &key, None, 1)?;

        let list = MasterKeyList::new(vec![old.clone(), new.clone()]);
        assert_eq!(list.newest().map(|mk| mk.kvno), Some(2));
        assert_eq!(decrypt_with_any_key(&crypto, &list, &kd)?.0, key);

        let list = MasterKeyList::new(vec![new]);
        assert!(matches!(
            decrypt_with_any_key(&crypto, &list, &kd),
            Err(Error::NoMatchingKey)
        ));
        Ok(())
    }

    #[test]
    fn active_master_key() {
        let list = [
            ActKvno { kvno: 1, act_time: 100 },
            ActKvno { kvno: 2, act_time: 200 },
            ActKvno { kvno: 3, act_time: 300 },
        ];
        assert_eq!(find_active_master_key(&list, 50), Some(1));
        assert_eq!(find_active_master_key(&list, 100), Some(1));
        assert_eq!(find_active_master_key(&list, 250), Some(2));
        assert_eq!(find_active_master_key(&list, 1000), Some(3));
        assert_eq!(find_active_master_key(&[], 1000), None);
    }
}
