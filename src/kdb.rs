//! [`Kdb`], the entry point to a principal database

use std::{cell::RefCell, path::Path, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{
    backend::{IterFlags, KdbBackend, NameFilter, PolicyCallback, PrincipalCallback},
    context::Context,
    conv::{dt_to_ts, now_ts},
    crypto::{find_active_master_key, Crypto, KeyBlock, MasterKey, MasterKeyList, SoftCrypto},
    db_args::{DbArgs, DbOptions},
    error::{Error, Result},
    key_data::{KeyData, KeyDataSalt},
    lock::LockMode,
    lockout::AuthStatus,
    master_key,
    name::PrincipalName,
    params::Params,
    policy::PolicyEntry,
    principal::PrincipalEntry,
    registry::{self, LoadedModule},
    tl_data::KRB5_TL_DB_ARGS,
    ulog::{IpropRole, LastEntry, Ulog, UpdateEntry, UpdateResult},
    EncryptionType, KeySalts, SaltType,
};

/// An open principal database
///
/// Operations are routed to the backend module named in [`Params::module`]. With
/// [`Params::iprop_enabled`], principal changes are first recorded in the update log.
///
/// A `Kdb` is not thread safe. Open one per thread.
///
/// ```no_run
/// use kdb5::{Kdb, Params, PrincipalEntry, PrincipalName};
///
/// let params = Params::builder("EXAMPLE.COM")
///     .dbname("/var/lib/krb5kdc/principal")
///     .build()
///     .unwrap();
/// let kdb = Kdb::builder(params).create().unwrap();
/// let name = PrincipalName::parse("alice", Some("EXAMPLE.COM")).unwrap();
/// kdb.put_principal(&PrincipalEntry::new(name.clone())).unwrap();
/// assert!(kdb.principal_exists(&name).unwrap());
/// ```
pub struct Kdb {
    // Dropped in declaration order: the backend goes before its module
    ulog: Option<RefCell<Ulog>>,
    backend: Box<dyn KdbBackend>,
    module: Arc<LoadedModule>,
    context: Context,
}

impl std::fmt::Debug for Kdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kdb")
            .field("module", &self.module.name())
            .field("context", &self.context)
            .field("ulog", &self.ulog.is_some())
            .finish_non_exhaustive()
    }
}

impl Kdb {
    /// Construct a new [`KdbBuilder`]
    pub fn builder(params: Params) -> KdbBuilder {
        KdbBuilder::new(params)
    }

    /// Securely remove the database described by `params`
    pub fn destroy(params: &Params, db_args: Option<&DbArgs>) -> Result<()> {
        let options = match db_args {
            Some(db_args) => db_args.options()?,
            None => DbOptions::default(),
        };
        let module = registry::load(params.module())?;
        module.module().destroy(params, &options)
    }

    /// The database context
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Parameters the database was opened with
    pub fn params(&self) -> &Params {
        self.context.params()
    }

    /// Name of the backend module
    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    /// The backend
    pub fn backend(&self) -> &dyn KdbBackend {
        self.backend.as_ref()
    }

    /// Whether principal changes are recorded in the update log
    fn logging(&self) -> bool {
        self.ulog
            .as_ref()
            .is_some_and(|ulog| ulog.borrow().role() == IpropRole::Primary)
    }

    fn ulog(&self) -> Result<&RefCell<Ulog>> {
        self.ulog
            .as_ref()
            .ok_or(Error::OperationNotSupported("update log"))
    }

    /// Run `f` with the database locked exclusively
    fn exclusive<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R>,
    {
        self.backend.lock(LockMode::Exclusive)?;
        let result = f();
        let unlocked = self.backend.unlock();
        let value = result?;
        unlocked?;
        Ok(value)
    }

    // ### Locking

    /// Time of the last modification
    pub fn get_age(&self) -> Result<DateTime<Utc>> {
        self.backend.get_age()
    }

    /// Lock the database
    pub fn lock(&self, mode: LockMode) -> Result<()> {
        self.backend.lock(mode)
    }

    /// Release one level of locking
    pub fn unlock(&self) -> Result<()> {
        self.backend.unlock()
    }

    // ### Principals

    /// Retrieve a principal, with key data sorted by descending kvno
    pub fn get_principal(&self, name: &PrincipalName) -> Result<PrincipalEntry> {
        let mut entry = self.backend.get_principal(name)?;
        entry.sort_key_data();
        Ok(entry)
    }

    /// Check if a principal exists
    pub fn principal_exists(&self, name: &PrincipalName) -> Result<bool> {
        match self.backend.get_principal(name) {
            Ok(_) => Ok(true),
            Err(Error::NoEntry) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Store a principal, creating or replacing it
    ///
    /// [`KRB5_TL_DB_ARGS`] TL-data is used to pass per-call backend arguments and is never
    /// stored.
    pub fn put_principal(&self, entry: &PrincipalEntry) -> Result<()> {
        let mut entry = entry.clone();
        entry.tl_data.remove(KRB5_TL_DB_ARGS);
        if !self.logging() {
            return self.backend.put_principal(&entry);
        }
        self.exclusive(|| {
            let previous = match self.backend.get_principal(&entry.name) {
                Ok(previous) => Some(previous),
                Err(Error::NoEntry) => None,
                Err(err) => return Err(err),
            };
            let mut update = UpdateEntry::put(&entry, previous.as_ref())?;
            self.ulog()?.borrow_mut().add_update(&mut update)?;
            self.backend.put_principal(&entry)
        })
    }

    /// Delete a principal
    pub fn delete_principal(&self, name: &PrincipalName) -> Result<()> {
        if !self.logging() {
            return self.backend.delete_principal(name);
        }
        self.exclusive(|| {
            // Nothing to log for a missing principal
            self.backend.get_principal(name)?;
            let mut update = UpdateEntry::delete(name);
            self.ulog()?.borrow_mut().add_update(&mut update)?;
            self.backend.delete_principal(name)
        })
    }

    /// Rename a principal
    ///
    /// Not available while changes are logged: a rename can't be expressed as a single update.
    pub fn rename_principal(&self, source: &PrincipalName, target: &PrincipalName) -> Result<()> {
        if self.logging() {
            return Err(Error::OperationNotSupported("rename_principal"));
        }
        self.backend.rename_principal(source, target)
    }

    /// Call `func` for each principal whose name passes `filter`
    pub fn iterate_principals(
        &self,
        filter: NameFilter<'_>,
        func: PrincipalCallback<'_>,
        flags: IterFlags,
    ) -> Result<()> {
        self.backend.iterate_principals(filter, func, flags)
    }

    /// List principal names passing `filter`
    pub fn list_principals(&self, filter: NameFilter<'_>) -> Result<Vec<PrincipalName>> {
        let mut names = Vec::new();
        self.backend.iterate_principals(
            filter,
            &mut |entry| {
                names.push(entry.name.clone());
                Ok(())
            },
            IterFlags::empty(),
        )?;
        Ok(names)
    }

    // ### Policies

    /// Create a policy
    pub fn create_policy(&self, policy: &PolicyEntry) -> Result<()> {
        self.backend.create_policy(policy)
    }

    /// Retrieve a policy
    pub fn get_policy(&self, name: &str) -> Result<PolicyEntry> {
        self.backend.get_policy(name)
    }

    /// Check if a policy exists
    pub fn policy_exists(&self, name: &str) -> Result<bool> {
        match self.backend.get_policy(name) {
            Ok(_) => Ok(true),
            Err(Error::NoEntry) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Replace an existing policy
    pub fn put_policy(&self, policy: &PolicyEntry) -> Result<()> {
        self.backend.put_policy(policy)
    }

    /// Delete a policy
    pub fn delete_policy(&self, name: &str) -> Result<()> {
        self.backend.delete_policy(name)
    }

    /// Call `func` for each policy
    pub fn iterate_policies(&self, func: PolicyCallback<'_>) -> Result<()> {
        self.backend.iterate_policies(func)
    }

    /// List policy names
    pub fn list_policies(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.backend.iterate_policies(&mut |policy| {
            names.push(policy.name.clone());
            Ok(())
        })?;
        Ok(names)
    }

    /// Make a bulk-loaded database live
    pub fn promote(&self) -> Result<()> {
        self.backend.promote()
    }

    // ### Keys

    /// Fetch the master key from the stash, the given version or the newest
    pub fn fetch_master_key(&self, kvno: Option<u32>) -> Result<MasterKey> {
        let mname = master_key::master_principal(self.params())?;
        self.backend.fetch_master_key(&self.context, &mname, kvno)
    }

    /// Decrypt every master key of the database with `mkey` and cache them in the context
    pub fn load_master_keys(&self, mkey: &MasterKey) -> Result<()> {
        let mname = master_key::master_principal(self.params())?;
        let list = self
            .backend
            .fetch_master_key_list(&self.context, &mname, mkey)?;
        log::debug!("loaded {} master keys", list.keys().len());
        self.context.set_master_keys(mkey.clone(), list);
        Ok(())
    }

    /// Write the cached master keys to the stash file `keyfile`
    pub fn store_master_key_list(&self, keyfile: &Path) -> Result<()> {
        let mname = master_key::master_principal(self.params())?;
        self.backend.store_master_key_list(
            &self.context,
            keyfile,
            &mname,
            &self.context.master_keys(),
        )
    }

    /// Create the master key principal of a new database, protecting `mkey`
    pub fn add_master_principal(&self, mkey: &MasterKey) -> Result<()> {
        let mname = master_key::master_principal(self.params())?;
        let entry = master_key::new_master_entry(self.context.crypto(), mname, mkey, now_ts())?;
        self.put_principal(&entry)?;
        self.context
            .set_master_keys(mkey.clone(), MasterKeyList::new(vec![mkey.clone()]));
        Ok(())
    }

    /// Add a master key, becoming active at `act_time`
    ///
    /// The master keys must have been loaded with [`Self::load_master_keys`].
    pub fn add_master_key(&self, new: &MasterKey, act_time: DateTime<Utc>) -> Result<()> {
        let current = self.context.master_key().ok_or(Error::NoMasterKey)?;
        let keys = self.context.master_keys();
        let mname = master_key::master_principal(self.params())?;
        let mut entry = self.get_principal(&mname)?;
        master_key::add_master_key(
            self.context.crypto(),
            &mut entry,
            &keys,
            new,
            dt_to_ts(Some(act_time))?,
        )?;
        self.put_principal(&entry)?;

        let mut all = keys.keys().to_vec();
        all.push(new.clone());
        self.context.set_master_keys(current, MasterKeyList::new(all));
        log::info!("added master key {}", new.kvno);
        Ok(())
    }

    /// Master key that new keys are encrypted with at `now`
    ///
    /// Defaults to the newest loaded key when the activation list names none of them.
    pub fn active_master_key(&self, now: DateTime<Utc>) -> Result<MasterKey> {
        let keys = self.context.master_keys();
        let mname = master_key::master_principal(self.params())?;
        let entry = self.get_principal(&mname)?;
        let actkvno = entry.tl_data.actkvno()?;
        let active = find_active_master_key(&actkvno, dt_to_ts(Some(now))?)
            .and_then(|kvno| keys.find(u32::from(kvno)))
            .or_else(|| keys.newest());
        active.cloned().ok_or(Error::NoMasterKey)
    }

    /// Find a key of `entry`, see [`KdbBackend::search_enctype`]
    pub fn search_enctype<'e>(
        &self,
        entry: &'e PrincipalEntry,
        start: &mut usize,
        enctype: Option<EncryptionType>,
        salttype: Option<SaltType>,
        kvno: Option<u16>,
    ) -> Result<&'e KeyData> {
        self.backend
            .search_enctype(&self.context, entry, start, enctype, salttype, kvno)
    }

    /// Decrypt key data with `mkey`, or with any loaded master key
    pub fn decrypt_key_data(
        &self,
        mkey: Option<&MasterKey>,
        key_data: &KeyData,
    ) -> Result<(KeyBlock, KeyDataSalt)> {
        self.backend
            .decrypt_key_data(&self.context, mkey, key_data)
    }

    /// Encrypt a key under `mkey`
    pub fn encrypt_key_data(
        &self,
        mkey: &MasterKey,
        key: &KeyBlock,
        salt: Option<&KeyDataSalt>,
        kvno: u16,
    ) -> Result<KeyData> {
        self.backend
            .encrypt_key_data(&self.context, mkey, key, salt, kvno)
    }

    /// Replace the keys of `entry` under the active master key
    ///
    /// Keys are derived from `password`, or random without one. The entry isn't stored.
    pub fn change_password(
        &self,
        entry: &mut PrincipalEntry,
        keysalts: &KeySalts,
        password: Option<&str>,
        kvno: Option<u16>,
        keepold: bool,
    ) -> Result<()> {
        let mkey = self.active_master_key(Utc::now())?;
        self.backend.change_password(
            &self.context,
            &mkey,
            entry,
            keysalts,
            password,
            kvno,
            keepold,
        )
    }

    // ### Authentication policy

    /// Fail with [`Error::ClientRevoked`] if `client` may not get initial tickets at `now`
    pub fn check_policy_as(&self, client: &PrincipalEntry, now: DateTime<Utc>) -> Result<()> {
        self.backend
            .check_policy_as(&self.context, client, dt_to_ts(Some(now))?)
    }

    /// Checks before issuing a service ticket to `client`
    pub fn check_policy_tgs(&self, client: &PrincipalEntry, now: DateTime<Utc>) -> Result<()> {
        self.backend
            .check_policy_tgs(&self.context, client, dt_to_ts(Some(now))?)
    }

    /// Record the outcome of an initial ticket request for `client`
    pub fn audit_as_req(
        &self,
        client: &PrincipalEntry,
        now: DateTime<Utc>,
        status: AuthStatus,
    ) -> Result<()> {
        self.backend
            .audit_as_req(&self.context, client, dt_to_ts(Some(now))?, status)
    }

    // ### Update log

    /// Replication role of this process
    pub fn ulog_role(&self) -> Result<IpropRole> {
        Ok(self.ulog()?.borrow().role())
    }

    /// Set the replication role of this process
    pub fn ulog_set_role(&self, role: IpropRole) -> Result<()> {
        self.ulog()?.borrow_mut().set_role(role);
        Ok(())
    }

    /// Serial number and timestamp of the newest logged update
    pub fn ulog_get_last(&self) -> Result<LastEntry> {
        self.ulog()?.borrow_mut().get_last()
    }

    /// Restart the update log at `last` after a full resync
    pub fn ulog_set_last(&self, last: &LastEntry) -> Result<()> {
        self.ulog()?.borrow_mut().set_last(last)
    }

    /// Updates a replica whose newest update is `last` is missing
    pub fn ulog_get_entries(&self, last: &LastEntry) -> Result<UpdateResult> {
        self.ulog()?.borrow_mut().get_entries(last)
    }

    /// Apply updates received from a primary
    pub fn ulog_replay(&self, updates: &[UpdateEntry]) -> Result<()> {
        self.ulog()?
            .borrow_mut()
            .replay(self.backend.as_ref(), updates)
    }
}

/// [`Kdb`] builder
pub struct KdbBuilder {
    params: Params,
    crypto: Option<Box<dyn Crypto>>,
    db_args: Option<DbArgs>,
}

impl std::fmt::Debug for KdbBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KdbBuilder")
            .field("params", &self.params)
            .field("db_args", &self.db_args)
            .finish_non_exhaustive()
    }
}

impl KdbBuilder {
    /// Create a new [`KdbBuilder`] instance
    pub fn new(params: Params) -> Self {
        Self {
            params,
            crypto: None,
            db_args: None,
        }
    }

    /// Set the crypto provider, [`SoftCrypto`] by default
    pub fn crypto(mut self, crypto: Box<dyn Crypto>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Provide additional [`DbArgs`] to the backend
    pub fn db_args(mut self, db_args: DbArgs) -> Self {
        self.db_args = Some(db_args);
        self
    }

    /// Open an existing database
    pub fn open(self) -> Result<Kdb> {
        self.build(false)
    }

    /// Create a database, or the target of a bulk load with the `temporary` argument
    pub fn create(self) -> Result<Kdb> {
        self.build(true)
    }

    fn build(self, create: bool) -> Result<Kdb> {
        let options = match &self.db_args {
            Some(db_args) => db_args.options()?,
            None => DbOptions::default(),
        };
        let module = registry::load(self.params.module())?;
        let backend = if create {
            module.module().create(&self.params, &options)?
        } else {
            module.module().open(&self.params, &options)?
        };

        // Bulk loads are not logged, replicas get a full resync instead
        let ulog = if self.params.iprop_enabled() && !options.temporary {
            Some(RefCell::new(Ulog::from_params(&self.params)?))
        } else {
            None
        };
        log::debug!(
            "opened {} database {}",
            module.name(),
            options
                .dbname
                .as_deref()
                .unwrap_or_else(|| self.params.dbname())
                .display()
        );

        let crypto = self.crypto.unwrap_or_else(|| Box::new(SoftCrypto));
        Ok(Kdb {
            ulog,
            backend,
            module,
            context: Context::with_crypto(self.params, crypto),
        })
    }
}
