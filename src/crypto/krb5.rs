//! Crypto provider backed by the system krb5 library, loaded at runtime

use std::{
    ffi::{c_char, CStr, OsStr},
    mem::MaybeUninit,
    ptr::{null, null_mut},
};

use dlopen2::wrapper::Container;
use zeroize::Zeroize;

use super::{Crypto, KeyBlock};
use crate::{
    error::{krb5_error_code_escape_hatch, Error, Result},
    sys::{self, krb5_context, krb5_data, krb5_enc_data, krb5_keyblock, Api},
    EncryptionType,
};

/// Key usage of master key envelopes
const KEY_USAGE: i32 = 0;

/// [`Crypto`] provider calling `krb5_c_*` functions
pub struct Krb5Crypto {
    library: Container<Api>,
    context: krb5_context,
}

impl Krb5Crypto {
    /// Load libkrb5 from the usual locations and create a context
    pub fn new() -> Result<Self> {
        Self::with_library(sys::load()?)
    }

    /// Load libkrb5 from `path` and create a context
    pub fn from_path<S: AsRef<OsStr>>(path: S) -> Result<Self> {
        Self::with_library(sys::load_from_path(path)?)
    }

    fn with_library(library: Container<Api>) -> Result<Self> {
        let mut context: MaybeUninit<krb5_context> = MaybeUninit::zeroed();
        let code = unsafe { library.krb5_init_context(context.as_mut_ptr()) };
        // No context to fetch a message from
        krb5_error_code_escape_hatch(code, |code| format!("krb5_init_context failed ({code})"))?;
        Ok(Self {
            context: unsafe { context.assume_init() },
            library,
        })
    }

    fn check(&self, code: i32) -> Result<()> {
        krb5_error_code_escape_hatch(code, |code| {
            let message: *const c_char =
                unsafe { self.library.krb5_get_error_message(self.context, code) };
            if message.is_null() {
                return format!("unknown error {code}");
            }
            let string = unsafe { CStr::from_ptr(message) }
                .to_string_lossy()
                .into_owned();
            unsafe { self.library.krb5_free_error_message(self.context, message) };
            string
        })
    }

    /// Copy a library-owned keyblock and free its contents
    fn take_keyblock(&self, mut raw: krb5_keyblock) -> KeyBlock {
        let contents = if raw.contents.is_null() {
            vec![]
        } else {
            unsafe { std::slice::from_raw_parts(raw.contents, raw.length as usize) }.to_vec()
        };
        unsafe { self.library.krb5_free_keyblock_contents(self.context, &mut raw) };
        KeyBlock::new(raw.enctype.into(), contents)
    }
}

fn raw_keyblock(key: &KeyBlock) -> Result<krb5_keyblock> {
    Ok(krb5_keyblock {
        magic: 0,
        enctype: key.enctype.into(),
        length: key.contents.len().try_into().map_err(|_| Error::BadKeySize)?,
        contents: key.contents.as_ptr().cast_mut(),
    })
}

fn raw_data(data: &[u8]) -> Result<krb5_data> {
    Ok(krb5_data {
        magic: 0,
        length: data.len().try_into().map_err(|_| Error::FieldTooLong)?,
        data: data.as_ptr().cast_mut().cast(),
    })
}

fn empty_keyblock() -> krb5_keyblock {
    krb5_keyblock {
        magic: 0,
        enctype: 0,
        length: 0,
        contents: null_mut(),
    }
}

impl Drop for Krb5Crypto {
    fn drop(&mut self) {
        unsafe { self.library.krb5_free_context(self.context) };
    }
}

impl Crypto for Krb5Crypto {
    fn encrypt_length(&self, enctype: EncryptionType, input_length: usize) -> Result<usize> {
        let mut length = 0;
        let code = unsafe {
            self.library
                .krb5_c_encrypt_length(self.context, enctype.into(), input_length, &mut length)
        };
        self.check(code)?;
        Ok(length)
    }

    fn encrypt(&self, key: &KeyBlock, plaintext: &[u8]) -> Result<Vec<u8>> {
        let length = self.encrypt_length(key.enctype, plaintext.len())?;
        let mut buffer = vec![0u8; length];
        let keyblock = raw_keyblock(key)?;
        let input = raw_data(plaintext)?;
        let mut output = krb5_enc_data {
            magic: 0,
            enctype: 0,
            kvno: 0,
            ciphertext: krb5_data {
                magic: 0,
                length: length.try_into().map_err(|_| Error::FieldTooLong)?,
                data: buffer.as_mut_ptr().cast(),
            },
        };
        let code = unsafe {
            self.library.krb5_c_encrypt(
                self.context,
                &keyblock,
                KEY_USAGE,
                null(),
                &input,
                &mut output,
            )
        };
        self.check(code)?;
        buffer.truncate(output.ciphertext.length as usize);
        Ok(buffer)
    }

    fn decrypt(&self, key: &KeyBlock, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; ciphertext.len()];
        let keyblock = raw_keyblock(key)?;
        let input = krb5_enc_data {
            magic: 0,
            enctype: key.enctype.into(),
            kvno: 0,
            ciphertext: raw_data(ciphertext)?,
        };
        let mut output = krb5_data {
            magic: 0,
            length: input.ciphertext.length,
            data: buffer.as_mut_ptr().cast(),
        };
        let code = unsafe {
            self.library.krb5_c_decrypt(
                self.context,
                &keyblock,
                KEY_USAGE,
                null(),
                &input,
                &mut output,
            )
        };
        if let Err(err) = self.check(code) {
            buffer.zeroize();
            return Err(err);
        }
        buffer.truncate(output.length as usize);
        Ok(buffer)
    }

    fn make_random_key(&self, enctype: EncryptionType) -> Result<KeyBlock> {
        let mut raw = empty_keyblock();
        let code = unsafe {
            self.library
                .krb5_c_make_random_key(self.context, enctype.into(), &mut raw)
        };
        self.check(code)?;
        Ok(self.take_keyblock(raw))
    }

    fn string_to_key(
        &self,
        enctype: EncryptionType,
        password: &[u8],
        salt: &[u8],
    ) -> Result<KeyBlock> {
        let string = raw_data(password)?;
        let salt = raw_data(salt)?;
        let mut raw = empty_keyblock();
        let code = unsafe {
            self.library
                .krb5_c_string_to_key(self.context, enctype.into(), &string, &salt, &mut raw)
        };
        self.check(code)?;
        Ok(self.take_keyblock(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires libkrb5"]
    fn library_round_trip() -> Result<()> {
        let crypto = Krb5Crypto::new()?;
        let key = crypto.make_random_key(EncryptionType::AES256_CTS_HMAC_SHA1_96)?;
        assert_eq!(key.contents.len(), 32);
        let ciphertext = crypto.encrypt(&key, &[7; 16])?;
        let plaintext = crypto.decrypt(&key, &ciphertext)?;
        assert_eq!(plaintext, vec![7; 16]);
        Ok(())
    }
}
