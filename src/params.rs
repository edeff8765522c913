//! Define [`Params`] for a database context

use std::path::{Path, PathBuf};

use getset::CopyGetters;

use crate::{
    error::{Error, Result},
    EncryptionType,
};

/// Default number of update log entries
pub const DEFAULT_ULOG_ENTRIES: u32 = 1000;
/// Maximum number of update log entries
pub const MAX_ULOG_ENTRIES: u32 = 2500;
/// Default LMDB map size, in bytes
pub const DEFAULT_MAPSIZE: usize = 128 * 1024 * 1024;
/// Default master key principal name, without realm
pub const DEFAULT_MKEY_NAME: &str = "K/M";

/// Parameters for a database context
///
/// ```
/// use kdb5::Params;
///
/// let params = Params::builder("EXAMPLE.COM")
///     .module("klmdb")
///     .dbname("/var/lib/krb5kdc/principal")
///     .iprop(true)
///     .build()
///     .unwrap();
/// assert_eq!(params.ulog_path().to_str(), Some("/var/lib/krb5kdc/principal.ulog"));
/// ```
#[derive(Clone, Debug, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Params {
    /// Realm of the database
    #[getset(skip)]
    realm: String,
    /// Backend module name
    #[getset(skip)]
    module: String,
    /// Database base path
    #[getset(skip)]
    dbname: PathBuf,
    /// Master key stash file
    #[getset(skip)]
    stash_file: Option<PathBuf>,
    /// Master key principal name, without realm
    #[getset(skip)]
    mkey_name: String,
    /// Master key encryption type
    mkey_enctype: EncryptionType,
    /// LMDB map size, in bytes
    mapsize: usize,
    /// LMDB maximum number of readers, 0 for the library default
    max_readers: u32,
    /// Disable synchronous writes of the primary LMDB environment
    nosync: bool,
    /// Don't track failed authentications
    disable_lockout: bool,
    /// Don't record successful authentications
    disable_last_success: bool,
    /// Release locks around iteration callbacks
    unlockiter: bool,
    /// Record changes in the update log
    iprop_enabled: bool,
    /// Update log file
    #[getset(skip)]
    iprop_logfile: Option<PathBuf>,
    /// Number of update log entries
    iprop_ulogsize: u32,
    /// Permitted encryption types, empty permits all
    #[getset(skip)]
    permitted_enctypes: Vec<EncryptionType>,
}

impl Params {
    /// Construct a new [`ParamsBuilder`]
    pub fn builder(realm: &str) -> ParamsBuilder {
        ParamsBuilder::new(realm)
    }

    /// Realm of the database
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Backend module name
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Database base path
    pub fn dbname(&self) -> &Path {
        &self.dbname
    }

    /// Master key stash file
    pub fn stash_file(&self) -> Option<&Path> {
        self.stash_file.as_deref()
    }

    /// Master key principal name, without realm
    pub fn mkey_name(&self) -> &str {
        &self.mkey_name
    }

    /// Update log file, defaults to the database name with a `.ulog` suffix
    pub fn ulog_path(&self) -> PathBuf {
        match &self.iprop_logfile {
            Some(path) => path.clone(),
            None => suffixed(&self.dbname, ".ulog"),
        }
    }

    /// Whether `enctype` may be used
    pub fn is_permitted_enctype(&self, enctype: EncryptionType) -> bool {
        self.permitted_enctypes.is_empty() || self.permitted_enctypes.contains(&enctype)
    }

    /// Copy of these parameters pointing to another database
    pub(crate) fn with_dbname(&self, dbname: PathBuf) -> Self {
        Self {
            dbname,
            ..self.clone()
        }
    }
}

/// Append `suffix` to the file name of `path`
pub(crate) fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// [`Params`] builder
#[derive(Clone, Debug)]
pub struct ParamsBuilder {
    params: Params,
}

impl ParamsBuilder {
    fn new(realm: &str) -> Self {
        Self {
            params: Params {
                realm: realm.to_owned(),
                module: "klmdb".to_owned(),
                dbname: PathBuf::from("principal"),
                stash_file: None,
                mkey_name: DEFAULT_MKEY_NAME.to_owned(),
                mkey_enctype: EncryptionType::AES256_CTS_HMAC_SHA1_96,
                mapsize: DEFAULT_MAPSIZE,
                max_readers: 0,
                nosync: false,
                disable_lockout: false,
                disable_last_success: false,
                unlockiter: false,
                iprop_enabled: false,
                iprop_logfile: None,
                iprop_ulogsize: DEFAULT_ULOG_ENTRIES,
                permitted_enctypes: vec![],
            },
        }
    }

    /// Set the backend module, `klmdb` or `db2`
    pub fn module(mut self, module: &str) -> Self {
        self.params.module = module.to_owned();
        self
    }

    /// Set the database base path
    pub fn dbname<P: AsRef<Path>>(mut self, dbname: P) -> Self {
        self.params.dbname = dbname.as_ref().to_path_buf();
        self
    }

    /// Set the master key stash file
    pub fn stash_file<P: AsRef<Path>>(mut self, stash_file: P) -> Self {
        self.params.stash_file = Some(stash_file.as_ref().to_path_buf());
        self
    }

    /// Set the master key principal name, without realm
    pub fn mkey_name(mut self, mkey_name: &str) -> Self {
        self.params.mkey_name = mkey_name.to_owned();
        self
    }

    /// Set the master key encryption type
    pub fn mkey_enctype(mut self, enctype: EncryptionType) -> Self {
        self.params.mkey_enctype = enctype;
        self
    }

    /// Set the LMDB map size, in bytes
    pub fn mapsize(mut self, mapsize: usize) -> Self {
        self.params.mapsize = mapsize;
        self
    }

    /// Set the LMDB maximum number of readers
    pub fn max_readers(mut self, max_readers: u32) -> Self {
        self.params.max_readers = max_readers;
        self
    }

    /// Disable synchronous writes of the primary LMDB environment
    pub fn nosync(mut self, nosync: bool) -> Self {
        self.params.nosync = nosync;
        self
    }

    /// Don't track failed authentications
    pub fn disable_lockout(mut self, disable: bool) -> Self {
        self.params.disable_lockout = disable;
        self
    }

    /// Don't record successful authentications
    pub fn disable_last_success(mut self, disable: bool) -> Self {
        self.params.disable_last_success = disable;
        self
    }

    /// Release locks around iteration callbacks
    pub fn unlockiter(mut self, unlockiter: bool) -> Self {
        self.params.unlockiter = unlockiter;
        self
    }

    /// Record changes in the update log
    pub fn iprop(mut self, enabled: bool) -> Self {
        self.params.iprop_enabled = enabled;
        self
    }

    /// Set the update log file
    pub fn iprop_logfile<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.params.iprop_logfile = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the number of update log entries
    pub fn iprop_ulogsize(mut self, entries: u32) -> Self {
        self.params.iprop_ulogsize = entries;
        self
    }

    /// Restrict the encryption types that may be used
    pub fn permitted_enctypes(mut self, enctypes: Vec<EncryptionType>) -> Self {
        self.params.permitted_enctypes = enctypes;
        self
    }

    /// Build the [`Params`]
    pub fn build(self) -> Result<Params> {
        let mut params = self.params;
        if params.realm.is_empty() {
            return Err(Error::BadDbArgs("empty realm".to_owned()));
        }
        if params.iprop_ulogsize == 0 {
            params.iprop_ulogsize = DEFAULT_ULOG_ENTRIES;
        }
        if params.iprop_ulogsize > MAX_ULOG_ENTRIES {
            log::warn!(
                "update log size {} exceeds {MAX_ULOG_ENTRIES}, clamping",
                params.iprop_ulogsize
            );
            params.iprop_ulogsize = MAX_ULOG_ENTRIES;
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() -> Result<()> {
        let params = Params::builder("EXAMPLE.COM").build()?;
        assert_eq!(params.module(), "klmdb");
        assert_eq!(params.iprop_ulogsize(), DEFAULT_ULOG_ENTRIES);
        assert!(params.is_permitted_enctype(EncryptionType::CAMELLIA128_CTS_CMAC));
        Ok(())
    }

    #[test]
    fn clamps_ulog_size() -> Result<()> {
        let params = Params::builder("EXAMPLE.COM")
            .iprop_ulogsize(10_000)
            .permitted_enctypes(vec![EncryptionType::AES256_CTS_HMAC_SHA1_96])
            .build()?;
        assert_eq!(params.iprop_ulogsize(), MAX_ULOG_ENTRIES);
        assert!(!params.is_permitted_enctype(EncryptionType::AES128_CTS_HMAC_SHA1_96));
        Ok(())
    }
}
