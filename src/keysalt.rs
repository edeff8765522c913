//! Kerberos keysalt lists
use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

/// Kerberos encryption type
// In MIT krb5: src/lib/crypto/krb/etypes.c
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(clippy::exhaustive_structs)]
#[repr(transparent)]
pub struct EncryptionType(i32);

impl EncryptionType {
    /// `aes128-cts-hmac-sha1-96`
    pub const AES128_CTS_HMAC_SHA1_96: Self = Self(17);
    /// `aes256-cts-hmac-sha1-96`
    pub const AES256_CTS_HMAC_SHA1_96: Self = Self(18);
    /// `aes128-cts-hmac-sha256-128`
    pub const AES128_CTS_HMAC_SHA256_128: Self = Self(19);
    /// `aes256-cts-hmac-sha384-192`
    pub const AES256_CTS_HMAC_SHA384_192: Self = Self(20);
    /// `camellia128-cts-cmac`
    pub const CAMELLIA128_CTS_CMAC: Self = Self(25);
    /// `camellia256-cts-cmac`
    pub const CAMELLIA256_CTS_CMAC: Self = Self(26);

    /// Length in bytes of a key of this type, if the type is known
    pub fn key_length(self) -> Option<usize> {
        match self {
            Self::AES128_CTS_HMAC_SHA1_96
            | Self::AES128_CTS_HMAC_SHA256_128
            | Self::CAMELLIA128_CTS_CMAC => Some(16),
            Self::AES256_CTS_HMAC_SHA1_96
            | Self::AES256_CTS_HMAC_SHA384_192
            | Self::CAMELLIA256_CTS_CMAC => Some(32),
            _ => None,
        }
    }

    fn names(self) -> Option<(&'static str, &'static str)> {
        Some(match self {
            Self::AES128_CTS_HMAC_SHA1_96 => ("aes128-cts-hmac-sha1-96", "aes128-cts"),
            Self::AES256_CTS_HMAC_SHA1_96 => ("aes256-cts-hmac-sha1-96", "aes256-cts"),
            Self::AES128_CTS_HMAC_SHA256_128 => ("aes128-cts-hmac-sha256-128", "aes128-sha2"),
            Self::AES256_CTS_HMAC_SHA384_192 => ("aes256-cts-hmac-sha384-192", "aes256-sha2"),
            Self::CAMELLIA128_CTS_CMAC => ("camellia128-cts-cmac", "camellia128-cts"),
            Self::CAMELLIA256_CTS_CMAC => ("camellia256-cts-cmac", "camellia256-cts"),
            _ => return None,
        })
    }

    const KNOWN: [Self; 6] = [
        Self::AES128_CTS_HMAC_SHA1_96,
        Self::AES256_CTS_HMAC_SHA1_96,
        Self::AES128_CTS_HMAC_SHA256_128,
        Self::AES256_CTS_HMAC_SHA384_192,
        Self::CAMELLIA128_CTS_CMAC,
        Self::CAMELLIA256_CTS_CMAC,
    ];
}

impl From<EncryptionType> for i32 {
    fn from(enctype: EncryptionType) -> Self {
        enctype.0
    }
}

impl From<i32> for EncryptionType {
    fn from(enctype: i32) -> Self {
        Self(enctype)
    }
}

impl FromStr for EncryptionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(num) = s.parse::<i32>() {
            return Ok(Self(num));
        }
        Self::KNOWN
            .into_iter()
            .find(|enctype| {
                enctype
                    .names()
                    .is_some_and(|(long, short)| s.eq_ignore_ascii_case(long) || s.eq_ignore_ascii_case(short))
            })
            .ok_or_else(|| Error::BadDbArgs(format!("unknown encryption type {s}")))
    }
}

impl fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.names() {
            Some((long, _)) => f.write_str(long),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Kerberos salt type
// In MIT krb5: src/lib/krb5/krb/str_conv.c
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[allow(clippy::exhaustive_structs)]
#[repr(transparent)]
pub struct SaltType(i32);

impl SaltType {
    /// Realm followed by the name components
    pub const NORMAL: Self = Self(0);
    /// Empty salt
    pub const V4: Self = Self(1);
    /// Name components without the realm
    pub const NOREALM: Self = Self(2);
    /// Realm only
    pub const ONLYREALM: Self = Self(3);
    /// Explicit salt stored with the key
    pub const SPECIAL: Self = Self(4);
    /// AFS version 3 string-to-key salt
    pub const AFS3: Self = Self(5);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::NORMAL => "normal",
            Self::V4 => "v4",
            Self::NOREALM => "norealm",
            Self::ONLYREALM => "onlyrealm",
            Self::SPECIAL => "special",
            Self::AFS3 => "afs3",
            _ => return None,
        })
    }

    /// Salt types whose value is computed from the principal name
    pub fn depends_on_name(self) -> bool {
        matches!(self, Self::NORMAL | Self::NOREALM | Self::ONLYREALM)
    }
}

impl From<SaltType> for i32 {
    fn from(salttype: SaltType) -> Self {
        salttype.0
    }
}

impl From<i32> for SaltType {
    fn from(salttype: i32) -> Self {
        Self(salttype)
    }
}

impl FromStr for SaltType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::NORMAL);
        }
        [
            Self::NORMAL,
            Self::V4,
            Self::NOREALM,
            Self::ONLYREALM,
            Self::SPECIAL,
            Self::AFS3,
        ]
        .into_iter()
        .find(|salttype| salttype.name().is_some_and(|name| s.eq_ignore_ascii_case(name)))
        .ok_or_else(|| Error::BadDbArgs(format!("unknown salt type {s}")))
    }
}

impl fmt::Display for SaltType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Kerberos keysalt
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(clippy::exhaustive_structs)]
pub struct KeySalt {
    /// Encryption type
    pub enctype: EncryptionType,
    /// Salt type
    pub salttype: SaltType,
}

impl FromStr for KeySalt {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (enctype, salttype) = match s.split_once(':') {
            Some((enctype, salttype)) => (enctype.parse()?, salttype.parse()?),
            None => (s.parse()?, SaltType::default()),
        };
        Ok(Self { enctype, salttype })
    }
}

impl fmt::Display for KeySalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.enctype, self.salttype)
    }
}

/// Kerberos keysalt list
///
/// Order is kept, duplicates are dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct KeySalts {
    /// Keysalt list
    pub keysalts: Vec<KeySalt>,
}

impl KeySalts {
    /// Add a keysalt if it isn't already in the list
    pub fn push(&mut self, keysalt: KeySalt) {
        if !self.keysalts.contains(&keysalt) {
            self.keysalts.push(keysalt);
        }
    }

    /// Whether any keysalt uses `enctype`
    pub fn contains_enctype(&self, enctype: EncryptionType) -> bool {
        self.keysalts.iter().any(|ks| ks.enctype == enctype)
    }
}

impl FromStr for KeySalts {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut keysalts = Self::default();
        for ks in s.split([',', ' ', '\t']).filter(|ks| !ks.is_empty()) {
            keysalts.push(ks.parse()?);
        }
        Ok(keysalts)
    }
}

impl fmt::Display for KeySalts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list: Vec<String> = self.keysalts.iter().map(ToString::to_string).collect();
        f.write_str(&list.join(","))
    }
}
