//! The [`KdbBackend`] interface implemented by storage engines
//!
//! Backends implement the storage primitives. Key handling, renames and password changes have
//! default implementations written on top of those primitives, which backends may override.

use std::path::Path;

use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::{
    context::Context,
    conv::now_ts,
    crypto::{self, decrypt_with_any_key, KeyBlock, MasterKey, MasterKeyList},
    db_args::DbOptions,
    error::{Error, Result},
    key_data::{max_kvno, KeyData, KeyDataSalt},
    lock::LockMode,
    lockout::AuthStatus,
    master_key,
    name::PrincipalName,
    params::Params,
    policy::PolicyEntry,
    principal::PrincipalEntry,
    EncryptionType, KeySalts, SaltType,
};

bitflags! {
    /// Iteration flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct IterFlags: u32 {
        /// The callback writes to the database
        const Write = 0x0000_0001;
        /// Iterate in reverse key order
        const Reverse = 0x0000_0002;

        const _ = !0;
    }
}

/// Callback invoked for each principal during iteration
pub type PrincipalCallback<'a> = &'a mut dyn FnMut(&PrincipalEntry) -> Result<()>;
/// Callback invoked for each policy during iteration
pub type PolicyCallback<'a> = &'a mut dyn FnMut(&PolicyEntry) -> Result<()>;
/// Predicate on unparsed principal names, selecting which entries are iterated
pub type NameFilter<'a> = Option<&'a dyn Fn(&str) -> bool>;

/// A storage module: a factory for [`KdbBackend`] handles
pub trait KdbModule: Send + Sync {
    /// Module name, as used in [`Params::module`]
    fn name(&self) -> &'static str;

    /// Open an existing database
    fn open(&self, params: &Params, options: &DbOptions) -> Result<Box<dyn KdbBackend>>;

    /// Create a database, or the target of a bulk load with `options.temporary`
    fn create(&self, params: &Params, options: &DbOptions) -> Result<Box<dyn KdbBackend>>;

    /// Securely remove a database
    fn destroy(&self, params: &Params, options: &DbOptions) -> Result<()>;
}

/// An open database
///
/// Every method takes `&self`: callbacks passed to the iteration methods may call back into the
/// same handle.
pub trait KdbBackend {
    /// Time of the last modification
    fn get_age(&self) -> Result<DateTime<Utc>>;

    /// Lock the database
    fn lock(&self, mode: LockMode) -> Result<()>;

    /// Release one level of locking
    fn unlock(&self) -> Result<()>;

    /// Fetch a principal, with key data sorted by descending kvno
    fn get_principal(&self, name: &PrincipalName) -> Result<PrincipalEntry>;

    /// Store a principal, replacing any existing entry of the same name
    fn put_principal(&self, entry: &PrincipalEntry) -> Result<()>;

    /// Remove a principal
    fn delete_principal(&self, name: &PrincipalName) -> Result<()>;

    /// Call `func` for each principal whose name passes `filter`
    fn iterate_principals(
        &self,
        filter: NameFilter<'_>,
        func: PrincipalCallback<'_>,
        flags: IterFlags,
    ) -> Result<()>;

    /// Store a new policy, failing with [`Error::DuplicateEntry`] if it exists
    fn create_policy(&self, policy: &PolicyEntry) -> Result<()>;

    /// Fetch a policy
    fn get_policy(&self, name: &str) -> Result<PolicyEntry>;

    /// Replace an existing policy, failing with [`Error::NoEntry`] if it doesn't exist
    fn put_policy(&self, policy: &PolicyEntry) -> Result<()>;

    /// Call `func` for each policy
    fn iterate_policies(&self, func: PolicyCallback<'_>) -> Result<()>;

    /// Remove a policy
    fn delete_policy(&self, name: &str) -> Result<()>;

    /// Store the lockout attributes of `entry`
    ///
    /// Writes the whole entry unless the backend keeps lockout state separately.
    fn update_lockout(&self, entry: &PrincipalEntry) -> Result<()> {
        self.put_principal(entry)
    }

    /// Make a bulk-loaded database live
    fn promote(&self) -> Result<()> {
        Err(Error::OperationNotSupported("promote"))
    }

    /// Rename a principal, pinning salts that depend on the old name
    fn rename_principal(&self, source: &PrincipalName, target: &PrincipalName) -> Result<()> {
        match self.get_principal(target) {
            Ok(_) => return Err(Error::InUse),
            Err(Error::NoEntry) => {}
            Err(err) => return Err(err),
        }
        let mut entry = self.get_principal(source)?;
        specialize_salts(&mut entry);
        entry.name = target.clone();
        self.put_principal(&entry)?;
        self.delete_principal(source)
    }

    /// Find the next key matching the requested attributes, starting at `*start`
    ///
    /// `None` filters match anything. A `kvno` of 0 selects the highest version, which is also
    /// the default when no filter is given. On success `*start` points past the returned key so
    /// that the search can be resumed.
    fn search_enctype<'e>(
        &self,
        ctx: &Context,
        entry: &'e PrincipalEntry,
        start: &mut usize,
        enctype: Option<EncryptionType>,
        salttype: Option<SaltType>,
        kvno: Option<u16>,
    ) -> Result<&'e KeyData> {
        let mut kvno = match (enctype, salttype, kvno) {
            (None, None, None) => Some(0),
            (_, _, kvno) => kvno,
        };
        if kvno == Some(0) {
            kvno = Some(max_kvno(&entry.key_data));
        }

        let mut saw_non_permitted = false;
        for (i, kd) in entry.key_data.iter().enumerate().skip(*start) {
            if enctype.is_some_and(|enctype| kd.enctype() != enctype) {
                continue;
            }
            if salttype.is_some_and(|salttype| kd.salttype() != salttype) {
                continue;
            }
            if let Some(kvno) = kvno {
                // Key data is sorted by descending kvno
                if kd.kvno < kvno {
                    break;
                }
                if kd.kvno != kvno {
                    continue;
                }
            }
            if !ctx.params().is_permitted_enctype(kd.enctype()) {
                saw_non_permitted = true;
                continue;
            }
            *start = i + 1;
            return Ok(kd);
        }
        if saw_non_permitted {
            Err(Error::NoPermittedKey)
        } else {
            Err(Error::NoMatchingKey)
        }
    }

    /// Decrypt key data, with `mkey` or else with any cached master key
    ///
    /// When no cached master key works, the master key list is reloaded once.
    fn decrypt_key_data(
        &self,
        ctx: &Context,
        mkey: Option<&MasterKey>,
        key_data: &KeyData,
    ) -> Result<(KeyBlock, KeyDataSalt)> {
        if let Some(mkey) = mkey {
            return crypto::decrypt_key_data(ctx.crypto(), &mkey.key, key_data);
        }
        match decrypt_with_any_key(ctx.crypto(), &ctx.master_keys(), key_data) {
            Err(Error::NoMatchingKey) => {}
            result => return result,
        }
        let Some(current) = ctx.master_key() else {
            return Err(Error::NoMatchingKey);
        };
        log::debug!("no cached master key decrypts key data, reloading the master key list");
        let mname = master_key::master_principal(ctx.params())?;
        let list = self.fetch_master_key_list(ctx, &mname, &current)?;
        ctx.set_master_keys(current, list);
        decrypt_with_any_key(ctx.crypto(), &ctx.master_keys(), key_data)
    }

    /// Encrypt a cleartext key under `mkey`
    fn encrypt_key_data(
        &self,
        ctx: &Context,
        mkey: &MasterKey,
        key: &KeyBlock,
        salt: Option<&KeyDataSalt>,
        kvno: u16,
    ) -> Result<KeyData> {
        crypto::encrypt_key_data(ctx.crypto(), &mkey.key, key, salt, kvno)
    }

    /// Fetch a master key from the configured stash file
    fn fetch_master_key(
        &self,
        ctx: &Context,
        _mname: &PrincipalName,
        kvno: Option<u32>,
    ) -> Result<MasterKey> {
        let stash = ctx.params().stash_file().ok_or(Error::NoMasterKey)?;
        master_key::fetch_stashed_key(stash, kvno)
    }

    /// Decrypt every master key stored in the master key principal `mname` with `mkey`
    fn fetch_master_key_list(
        &self,
        ctx: &Context,
        mname: &PrincipalName,
        mkey: &MasterKey,
    ) -> Result<MasterKeyList> {
        let master_entry = match self.get_principal(mname) {
            Err(Error::NoEntry) => return Err(Error::NoMasterKey),
            result => result?,
        };
        master_key::unlock_master_keys(ctx.crypto(), &master_entry, mkey)
    }

    /// Write `list` to the stash file `keyfile`
    fn store_master_key_list(
        &self,
        _ctx: &Context,
        keyfile: &Path,
        _mname: &PrincipalName,
        list: &MasterKeyList,
    ) -> Result<()> {
        master_key::write_stash(keyfile, list)
    }

    /// Replace the keys of `entry`, one per distinct encryption type of `keysalts`
    ///
    /// Keys are derived from `password`, or random without one. The new kvno is `new_kvno`, or
    /// the current highest plus one. With `keepold` the previous keys are kept.
    #[allow(clippy::too_many_arguments)]
    fn change_password(
        &self,
        ctx: &Context,
        mkey: &MasterKey,
        entry: &mut PrincipalEntry,
        keysalts: &KeySalts,
        password: Option<&str>,
        new_kvno: Option<u16>,
        keepold: bool,
    ) -> Result<()> {
        let kvno = match new_kvno {
            Some(kvno) if kvno > 0 => kvno,
            _ => entry.kvno().wrapping_add(1),
        };

        let mut key_data = Vec::with_capacity(keysalts.keysalts.len());
        let mut seen = Vec::new();
        for ks in &keysalts.keysalts {
            if seen.contains(&ks.enctype) {
                continue;
            }
            seen.push(ks.enctype);

            let (key, salt) = match password {
                Some(password) => {
                    let (derivation, stored) = salt_for(&entry.name, ks.salttype);
                    let key = ctx
                        .crypto()
                        .string_to_key(ks.enctype, password.as_bytes(), &derivation)?;
                    let salt = KeyDataSalt {
                        salttype: ks.salttype,
                        contents: stored,
                    };
                    (key, Some(salt))
                }
                None => (ctx.crypto().make_random_key(ks.enctype)?, None),
            };
            key_data.push(self.encrypt_key_data(ctx, mkey, &key, salt.as_ref(), kvno)?);
        }

        if keepold {
            key_data.append(&mut entry.key_data);
        }
        entry.key_data = key_data;
        entry.sort_key_data();
        entry.tl_data.set_last_pwd_change(now_ts());
        Ok(())
    }

    /// Policy checks before issuing an initial ticket to `client`
    fn check_policy_as(&self, _ctx: &Context, _client: &PrincipalEntry, _now: u32) -> Result<()> {
        Ok(())
    }

    /// Policy checks before issuing a service ticket
    fn check_policy_tgs(&self, _ctx: &Context, _client: &PrincipalEntry, _now: u32) -> Result<()> {
        Ok(())
    }

    /// Record the outcome of an initial ticket request for `client`
    fn audit_as_req(
        &self,
        _ctx: &Context,
        _client: &PrincipalEntry,
        _now: u32,
        _status: AuthStatus,
    ) -> Result<()> {
        Ok(())
    }
}

/// Salt used to derive a key, and the salt contents stored with it
fn salt_for(name: &PrincipalName, salttype: SaltType) -> (Vec<u8>, Vec<u8>) {
    match salttype {
        SaltType::NORMAL => (name.normal_salt(), vec![]),
        SaltType::V4 => (vec![], vec![]),
        SaltType::NOREALM => {
            let salt = name.norealm_salt();
            (salt.clone(), salt)
        }
        SaltType::SPECIAL => {
            let mut salt = vec![0u8; 16];
            rand::RngCore::fill_bytes(&mut rand::rng(), &mut salt);
            (salt.clone(), salt)
        }
        _ => {
            let salt = name.realm().as_bytes().to_vec();
            (salt.clone(), salt)
        }
    }
}

/// Replace salts derived from the entry's name by explicit copies
pub(crate) fn specialize_salts(entry: &mut PrincipalEntry) {
    for kd in &mut entry.key_data {
        let contents = match kd.salttype() {
            SaltType::NORMAL => entry.name.normal_salt(),
            SaltType::NOREALM => entry.name.norealm_salt(),
            SaltType::ONLYREALM => entry.name.realm().as_bytes().to_vec(),
            _ => continue,
        };
        kd.salt = Some(KeyDataSalt {
            salttype: SaltType::SPECIAL,
            contents,
        });
    }
}
