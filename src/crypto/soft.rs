//! Pure-Rust crypto provider
//!
//! Keys of every supported encryption type wrap data with AES-256-GCM under a subkey derived
//! with HKDF-SHA256. Ciphertexts are not interoperable with krb5; use [`super::Krb5Crypto`] for
//! databases shared with MIT tools.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::{Crypto, KeyBlock};
use crate::{
    error::{Error, Result},
    EncryptionType,
};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Pure-Rust [`Crypto`] provider
#[derive(Copy, Clone, Debug, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct SoftCrypto;

fn key_length(enctype: EncryptionType) -> Result<usize> {
    enctype
        .key_length()
        .ok_or(Error::BadEncryptionType(enctype.into()))
}

fn cipher(key: &KeyBlock) -> Result<Aes256Gcm> {
    if key.contents.len() != key_length(key.enctype)? {
        return Err(Error::BadKeySize);
    }
    let hkdf = Hkdf::<Sha256>::new(Some(b"kdb5 envelope"), &key.contents);
    let mut subkey = Zeroizing::new([0u8; 32]);
    hkdf.expand(&i32::from(key.enctype).to_le_bytes(), subkey.as_mut())
        .map_err(|_| Error::BadKeySize)?;
    Aes256Gcm::new_from_slice(subkey.as_ref()).map_err(|_| Error::BadKeySize)
}

impl Crypto for SoftCrypto {
    fn encrypt_length(&self, enctype: EncryptionType, input_length: usize) -> Result<usize> {
        key_length(enctype)?;
        Ok(NONCE_LEN + input_length + TAG_LEN)
    }

    fn encrypt(&self, key: &KeyBlock, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = cipher(key)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Integrity)?;
        let mut out = Vec::new();
        out.try_reserve(NONCE_LEN + ciphertext.len())?;
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &KeyBlock, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Integrity);
        }
        let (nonce, ciphertext) = ciphertext.split_at(NONCE_LEN);
        cipher(key)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Integrity)
    }

    fn make_random_key(&self, enctype: EncryptionType) -> Result<KeyBlock> {
        let mut contents = vec![0; key_length(enctype)?];
        rand::rng().fill_bytes(&mut contents);
        Ok(KeyBlock::new(enctype, contents))
    }

    fn string_to_key(
        &self,
        enctype: EncryptionType,
        password: &[u8],
        salt: &[u8],
    ) -> Result<KeyBlock> {
        let mut contents = vec![0; key_length(enctype)?];
        let mut info = b"kdb5 string-to-key".to_vec();
        info.extend_from_slice(&i32::from(enctype).to_le_bytes());
        Hkdf::<Sha256>::new(Some(salt), password)
            .expand(&info, &mut contents)
            .map_err(|_| Error::BadKeySize)?;
        Ok(KeyBlock::new(enctype, contents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt() -> Result<()> {
        let key = SoftCrypto.make_random_key(EncryptionType::AES256_CTS_HMAC_SHA1_96)?;
        let ciphertext = SoftCrypto.encrypt(&key, b"secret key bytes")?;
        assert_eq!(
            ciphertext.len(),
            SoftCrypto.encrypt_length(key.enctype, 16)?
        );
        assert_eq!(SoftCrypto.decrypt(&key, &ciphertext)?, b"secret key bytes");

        let other = SoftCrypto.make_random_key(EncryptionType::AES256_CTS_HMAC_SHA1_96)?;
        assert!(matches!(
            SoftCrypto.decrypt(&other, &ciphertext),
            Err(Error::Integrity)
        ));
        Ok(())
    }

    #[test]
    fn string_to_key_is_deterministic() -> Result<()> {
        let enctype = EncryptionType::AES128_CTS_HMAC_SHA1_96;
        let a = SoftCrypto.string_to_key(enctype, b"password", b"EXAMPLE.COMalice")?;
        let b = SoftCrypto.string_to_key(enctype, b"password", b"EXAMPLE.COMalice")?;
        let c = SoftCrypto.string_to_key(enctype, b"password", b"EXAMPLE.COMbob")?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.contents.len(), 16);
        Ok(())
    }

    #[test]
    fn unknown_enctype() {
        assert!(matches!(
            SoftCrypto.make_random_key(EncryptionType::from(1)),
            Err(Error::BadEncryptionType(1))
        ));
    }
}
