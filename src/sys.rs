//! Runtime bindings to the krb5 crypto library
#![allow(missing_docs)]
#![allow(non_camel_case_types)]
#![allow(clippy::exhaustive_structs)]

use std::ffi::{c_char, c_void, OsStr};

use dlopen2::wrapper::{Container, WrapperApi};

use crate::error::Result;

/// `krb5_context`
pub type krb5_context = *mut c_void;
/// `krb5_error_code`
pub type krb5_error_code = i32;

/// `krb5_data`
#[repr(C)]
#[derive(Debug)]
pub struct krb5_data {
    pub magic: i32,
    pub length: u32,
    pub data: *mut c_char,
}

/// `krb5_keyblock`
#[repr(C)]
#[derive(Debug)]
pub struct krb5_keyblock {
    pub magic: i32,
    pub enctype: i32,
    pub length: u32,
    pub contents: *mut u8,
}

/// `krb5_enc_data`
#[repr(C)]
#[derive(Debug)]
pub struct krb5_enc_data {
    pub magic: i32,
    pub enctype: i32,
    pub kvno: u32,
    pub ciphertext: krb5_data,
}

/// Functions used from libkrb5
#[derive(WrapperApi)]
pub struct Api {
    krb5_init_context: unsafe extern "C" fn(context: *mut krb5_context) -> krb5_error_code,
    krb5_free_context: unsafe extern "C" fn(context: krb5_context),
    krb5_get_error_message:
        unsafe extern "C" fn(context: krb5_context, code: krb5_error_code) -> *const c_char,
    krb5_free_error_message: unsafe extern "C" fn(context: krb5_context, msg: *const c_char),
    krb5_c_encrypt_length: unsafe extern "C" fn(
        context: krb5_context,
        enctype: i32,
        inputlen: usize,
        length: *mut usize,
    ) -> krb5_error_code,
    krb5_c_encrypt: unsafe extern "C" fn(
        context: krb5_context,
        key: *const krb5_keyblock,
        usage: i32,
        cipher_state: *const krb5_data,
        input: *const krb5_data,
        output: *mut krb5_enc_data,
    ) -> krb5_error_code,
    krb5_c_decrypt: unsafe extern "C" fn(
        context: krb5_context,
        key: *const krb5_keyblock,
        usage: i32,
        cipher_state: *const krb5_data,
        input: *const krb5_enc_data,
        output: *mut krb5_data,
    ) -> krb5_error_code,
    krb5_c_make_random_key: unsafe extern "C" fn(
        context: krb5_context,
        enctype: i32,
        random_key: *mut krb5_keyblock,
    ) -> krb5_error_code,
    krb5_c_string_to_key: unsafe extern "C" fn(
        context: krb5_context,
        enctype: i32,
        string: *const krb5_data,
        salt: *const krb5_data,
        key: *mut krb5_keyblock,
    ) -> krb5_error_code,
    krb5_free_keyblock_contents: unsafe extern "C" fn(context: krb5_context, key: *mut krb5_keyblock),
}

const LIBRARY_PATHS: [&str; 4] = [
    "/usr/lib",
    "/usr/lib64",
    "/usr/lib/x86_64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
];
const LIBRARIES: [&str; 2] = ["libkrb5.so.3", "libkrb5.so"];

/// Load libkrb5 from the usual locations
pub fn load() -> Result<Container<Api>> {
    for path in LIBRARY_PATHS {
        for library in LIBRARIES {
            let full_path = format!("{path}/{library}");
            if let Ok(cont) = unsafe { Container::load(&full_path) } {
                return Ok(cont);
            }
        }
    }
    Ok(unsafe { Container::load(LIBRARIES[0]) }?)
}

/// Load libkrb5 from a custom path
pub fn load_from_path<S: AsRef<OsStr>>(path: S) -> Result<Container<Api>> {
    Ok(unsafe { Container::load(path) }?)
}
