//! LMDB storage backend
//!
//! Principals and policies live in two named databases of one environment, `<dbname>.mdb`.
//! Lockout attributes are kept out of the principal records, in a second environment
//! `<dbname>.lockout.mdb` opened without synchronous writes, so that authentication attempts
//! don't contend with administrative writes.
//!
//! A database created with the `temporary` option is the target of a bulk load: every write goes
//! to a transaction on the live environment that is only committed by [`KdbBackend::promote`].

use std::{
    cell::RefCell,
    ffi::c_uint,
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use lmdb::{
    Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, RoCursor, Transaction,
    WriteFlags,
};
use lmdb_sys as ffi;

use crate::{
    backend::{IterFlags, KdbBackend, KdbModule, NameFilter, PolicyCallback, PrincipalCallback},
    codec::marshal,
    context::Context,
    db_args::DbOptions,
    error::{Error, Result},
    fs,
    lock::LockMode,
    lockout::{self, AuthStatus},
    name::PrincipalName,
    params::{suffixed, Params},
    policy::PolicyEntry,
    principal::PrincipalEntry,
};

mod txn;

use txn::RawTxn;

const PRINCIPAL_DB: &str = "principal";
const POLICY_DB: &str = "policy";
const LOCKOUT_DB: &str = "lockout";

/// The `klmdb` module
#[derive(Copy, Clone, Debug, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct LmdbModule;

/// Files of a database
struct Paths {
    primary: PathBuf,
    lockout: PathBuf,
}

impl Paths {
    fn new(params: &Params, options: &DbOptions) -> Self {
        let dbname = options
            .dbname
            .as_deref()
            .unwrap_or_else(|| params.dbname());
        Self {
            primary: suffixed(dbname, ".mdb"),
            lockout: suffixed(dbname, ".lockout.mdb"),
        }
    }
}

fn lock_file(path: &Path) -> PathBuf {
    suffixed(path, "-lock")
}

fn check_options(options: &DbOptions) -> Result<()> {
    if options.hash {
        return Err(Error::BadDbArgs("hash".to_owned()));
    }
    Ok(())
}

impl KdbModule for LmdbModule {
    fn name(&self) -> &'static str {
        "klmdb"
    }

    fn open(&self, params: &Params, options: &DbOptions) -> Result<Box<dyn KdbBackend>> {
        check_options(options)?;
        let paths = Paths::new(params, options);
        if !paths.primary.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("database {} does not exist", paths.primary.display()),
            )
            .into());
        }
        let backend = LmdbBackend::open(params, options, paths)?;
        if options.temporary {
            backend.begin_load()?;
        }
        Ok(Box::new(backend))
    }

    fn create(&self, params: &Params, options: &DbOptions) -> Result<Box<dyn KdbBackend>> {
        check_options(options)?;
        let paths = Paths::new(params, options);
        if !options.temporary && paths.primary.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("database {} already exists", paths.primary.display()),
            )
            .into());
        }
        let backend = LmdbBackend::open(params, options, paths)?;
        if options.temporary {
            backend.begin_load()?;
        }
        log::info!("created database {}", backend.path.display());
        Ok(Box::new(backend))
    }

    fn destroy(&self, params: &Params, options: &DbOptions) -> Result<()> {
        check_options(options)?;
        let paths = Paths::new(params, options);
        for path in [&paths.primary, &paths.lockout] {
            fs::destroy_file(path)?;
            fs::remove_if_exists(&lock_file(path))?;
        }
        log::info!("destroyed database {}", paths.primary.display());
        Ok(())
    }
}

/// An open LMDB database
pub struct LmdbBackend {
    // Raw transactions are declared before the environments so that they are dropped first
    load_txn: RefCell<Option<RawTxn>>,
    load_lockout_txn: RefCell<Option<RawTxn>>,
    read_txn: RefCell<Option<RawTxn>>,
    lockout_read_txn: RefCell<Option<RawTxn>>,

    principal_db: Database,
    policy_db: Database,
    lockout: Option<(Environment, Database)>,
    env: Environment,

    path: PathBuf,
    merge_nra: bool,
    unlockiter: bool,
}

fn open_env(
    path: &Path,
    flags: EnvironmentFlags,
    max_dbs: c_uint,
    params: &Params,
) -> Result<Environment> {
    let mut builder = Environment::new();
    builder
        .set_flags(flags | EnvironmentFlags::NO_SUB_DIR | EnvironmentFlags::NO_TLS)
        .set_max_dbs(max_dbs)
        .set_map_size(params.mapsize());
    if params.max_readers() > 0 {
        builder.set_max_readers(params.max_readers());
    }
    Ok(builder.open_with_permissions(path, 0o600)?)
}

impl LmdbBackend {
    fn open(params: &Params, options: &DbOptions, paths: Paths) -> Result<Self> {
        let mut flags = EnvironmentFlags::empty();
        if params.nosync() {
            flags |= EnvironmentFlags::NO_SYNC;
        }
        let env = open_env(&paths.primary, flags, 2, params)?;
        let principal_db = env.create_db(Some(PRINCIPAL_DB), DatabaseFlags::empty())?;
        let policy_db = env.create_db(Some(POLICY_DB), DatabaseFlags::empty())?;

        let lockout = if params.disable_lockout() && params.disable_last_success() {
            None
        } else {
            let env = open_env(&paths.lockout, EnvironmentFlags::NO_SYNC, 1, params)?;
            let db = env.create_db(Some(LOCKOUT_DB), DatabaseFlags::empty())?;
            Some((env, db))
        };
        log::debug!("opened LMDB environment {}", paths.primary.display());

        Ok(Self {
            load_txn: RefCell::new(None),
            load_lockout_txn: RefCell::new(None),
            read_txn: RefCell::new(None),
            lockout_read_txn: RefCell::new(None),
            principal_db,
            policy_db,
            lockout,
            env,
            path: paths.primary,
            merge_nra: options.merge_nra,
            unlockiter: options.unlockiter.unwrap_or(params.unlockiter()),
        })
    }

    /// Start the load transactions of a temporary database, emptying its contents
    ///
    /// With `merge_nra` the lockout records of the live database are kept.
    fn begin_load(&self) -> Result<()> {
        let mut txn = RawTxn::begin_rw(&self.env)?;
        txn.clear(self.principal_db)?;
        txn.clear(self.policy_db)?;
        *self.load_txn.borrow_mut() = Some(txn);

        if let Some((env, db)) = &self.lockout {
            let mut txn = RawTxn::begin_rw(env)?;
            if !self.merge_nra {
                txn.clear(*db)?;
            }
            *self.load_lockout_txn.borrow_mut() = Some(txn);
        }
        log::info!(
            "loading into {}{}",
            self.path.display(),
            if self.merge_nra { " (merging lockout state)" } else { "" }
        );
        Ok(())
    }

    fn loading(&self) -> bool {
        self.load_txn.borrow().is_some()
    }

    /// Read through the load transaction if one is active, else through the shared snapshot
    fn read(
        env: &Environment,
        load: &RefCell<Option<RawTxn>>,
        shared: &RefCell<Option<RawTxn>>,
        db: Database,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if let Some(txn) = load.borrow().as_ref() {
            return Ok(txn.get(db, key)?);
        }
        let mut shared = shared.borrow_mut();
        let mut txn = match shared.take() {
            Some(mut txn) => {
                txn.renew()?;
                txn
            }
            None => RawTxn::begin_ro(env)?,
        };
        let result = txn.get(db, key);
        txn.reset();
        *shared = Some(txn);
        Ok(result?)
    }

    /// Run `f` in the load transaction if one is active, else in its own committed transaction
    fn write<F>(env: &Environment, load: &RefCell<Option<RawTxn>>, f: F) -> Result<()>
    where
        F: FnOnce(&mut RawTxn) -> Result<()>,
    {
        if let Some(txn) = load.borrow_mut().as_mut() {
            return f(txn);
        }
        let mut txn = RawTxn::begin_rw(env)?;
        f(&mut txn)?;
        Ok(txn.commit()?)
    }

    fn get_primary(&self, db: Database, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Self::read(&self.env, &self.load_txn, &self.read_txn, db, key)
    }

    fn write_primary<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut RawTxn) -> Result<()>,
    {
        Self::write(&self.env, &self.load_txn, f)
    }

    fn get_lockout(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match &self.lockout {
            Some((env, db)) => {
                Self::read(env, &self.load_lockout_txn, &self.lockout_read_txn, *db, key)
            }
            None => Ok(None),
        }
    }

    /// Fill the lockout attributes of `entry` from its lockout record
    fn merge_lockout(&self, key: &[u8], entry: &mut PrincipalEntry) -> Result<()> {
        if let Some(record) = self.get_lockout(key)? {
            marshal::decode_lockout(&record, entry)?;
        }
        Ok(())
    }

    /// Write the lockout record of `entry` if it changed
    fn store_lockout(&self, key: &[u8], entry: &PrincipalEntry) -> Result<()> {
        let Some((env, db)) = &self.lockout else {
            return Ok(());
        };
        let record = marshal::encode_lockout(entry);
        if self.merge_nra && self.loading() {
            // Live lockout state wins over the loaded one
            return Self::write(env, &self.load_lockout_txn, |txn| {
                match txn.put(*db, key, &record, WriteFlags::NO_OVERWRITE) {
                    Ok(()) | Err(lmdb::Error::KeyExist) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            });
        }
        if self.get_lockout(key)?.as_deref() == Some(&record[..]) {
            return Ok(());
        }
        Self::write(env, &self.load_lockout_txn, |txn| {
            Ok(txn.put(*db, key, &record, WriteFlags::empty())?)
        })
    }

    fn decode(&self, key: &[u8], value: &[u8]) -> Result<PrincipalEntry> {
        let mut entry = marshal::decode_principal(key, value)?;
        self.merge_lockout(key, &mut entry)?;
        entry.sort_key_data();
        Ok(entry)
    }

    /// Next principal after `after` that passes `filter`, in a fresh read transaction
    fn next_principal(
        &self,
        after: Option<&[u8]>,
        reverse: bool,
        filter: NameFilter<'_>,
    ) -> Result<Option<(Vec<u8>, PrincipalEntry)>> {
        let txn = self.env.begin_ro_txn()?;
        let cursor = txn.open_ro_cursor(self.principal_db)?;
        let mut item = match after {
            Some(key) => reseek(&cursor, key, reverse)?,
            None => cursor_get(&cursor, first_op(reverse))?,
        };
        while let Some((key, value)) = item {
            if accepts(filter, key) {
                let entry = self.decode(key, value)?;
                return Ok(Some((key.to_vec(), entry)));
            }
            item = cursor_get(&cursor, step_op(reverse))?;
        }
        Ok(None)
    }
}

fn first_op(reverse: bool) -> c_uint {
    if reverse {
        ffi::MDB_LAST
    } else {
        ffi::MDB_FIRST
    }
}

fn step_op(reverse: bool) -> c_uint {
    if reverse {
        ffi::MDB_PREV
    } else {
        ffi::MDB_NEXT
    }
}

fn cursor_get<'txn>(
    cursor: &RoCursor<'txn>,
    op: c_uint,
) -> Result<Option<(&'txn [u8], &'txn [u8])>> {
    match cursor.get(None, None, op) {
        Ok((Some(key), value)) => Ok(Some((key, value))),
        Ok((None, _)) | Err(lmdb::Error::NotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Position `cursor` on the record following `key`, which may have been deleted meanwhile
fn reseek<'txn>(
    cursor: &RoCursor<'txn>,
    key: &[u8],
    reverse: bool,
) -> Result<Option<(&'txn [u8], &'txn [u8])>> {
    match cursor.get(Some(key), None, ffi::MDB_SET_RANGE) {
        Ok((found, value)) => {
            if reverse {
                cursor_get(cursor, ffi::MDB_PREV)
            } else if found.map_or(true, |found| found == key) {
                cursor_get(cursor, ffi::MDB_NEXT)
            } else {
                Ok(found.map(|found| (found, value)))
            }
        }
        Err(lmdb::Error::NotFound) if reverse => cursor_get(cursor, ffi::MDB_LAST),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn accepts(filter: NameFilter<'_>, key: &[u8]) -> bool {
    match filter {
        Some(filter) => std::str::from_utf8(key).is_ok_and(filter),
        None => true,
    }
}

fn not_found_as_no_entry(result: lmdb::Result<()>) -> Result<()> {
    match result {
        Err(lmdb::Error::NotFound) => Err(Error::NoEntry),
        result => Ok(result?),
    }
}

impl KdbBackend for LmdbBackend {
    fn get_age(&self) -> Result<DateTime<Utc>> {
        fs::mtime(&self.path)
    }

    fn lock(&self, _mode: LockMode) -> Result<()> {
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        Ok(())
    }

    fn get_principal(&self, name: &PrincipalName) -> Result<PrincipalEntry> {
        let key = name.unparse();
        let value = self
            .get_primary(self.principal_db, key.as_bytes())?
            .ok_or(Error::NoEntry)?;
        self.decode(key.as_bytes(), &value)
    }

    fn put_principal(&self, entry: &PrincipalEntry) -> Result<()> {
        let key = entry.name.unparse();
        let value = marshal::encode_principal(entry)?;
        self.write_primary(|txn| {
            Ok(txn.put(self.principal_db, key.as_bytes(), &value, WriteFlags::empty())?)
        })?;
        self.store_lockout(key.as_bytes(), entry)
    }

    fn delete_principal(&self, name: &PrincipalName) -> Result<()> {
        let key = name.unparse();
        self.write_primary(|txn| not_found_as_no_entry(txn.del(self.principal_db, key.as_bytes())))?;
        if let Some((env, db)) = &self.lockout {
            Self::write(env, &self.load_lockout_txn, |txn| {
                match txn.del(*db, key.as_bytes()) {
                    Ok(()) | Err(lmdb::Error::NotFound) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            })?;
        }
        Ok(())
    }

    fn iterate_principals(
        &self,
        filter: NameFilter<'_>,
        func: PrincipalCallback<'_>,
        flags: IterFlags,
    ) -> Result<()> {
        let reverse = flags.contains(IterFlags::Reverse);
        if self.unlockiter {
            let mut after: Option<Vec<u8>> = None;
            while let Some((key, entry)) = self.next_principal(after.as_deref(), reverse, filter)? {
                func(&entry)?;
                after = Some(key);
            }
            return Ok(());
        }

        let txn = self.env.begin_ro_txn()?;
        let cursor = txn.open_ro_cursor(self.principal_db)?;
        let mut item = cursor_get(&cursor, first_op(reverse))?;
        while let Some((key, value)) = item {
            if accepts(filter, key) {
                func(&self.decode(key, value)?)?;
            }
            item = cursor_get(&cursor, step_op(reverse))?;
        }
        Ok(())
    }

    fn create_policy(&self, policy: &PolicyEntry) -> Result<()> {
        let value = marshal::encode_policy(policy)?;
        self.write_primary(|txn| {
            match txn.put(self.policy_db, policy.name.as_bytes(), &value, WriteFlags::NO_OVERWRITE) {
                Err(lmdb::Error::KeyExist) => Err(Error::DuplicateEntry),
                result => Ok(result?),
            }
        })
    }

    fn get_policy(&self, name: &str) -> Result<PolicyEntry> {
        let value = self
            .get_primary(self.policy_db, name.as_bytes())?
            .ok_or(Error::NoEntry)?;
        marshal::decode_policy(name.as_bytes(), &value)
    }

    fn put_policy(&self, policy: &PolicyEntry) -> Result<()> {
        let value = marshal::encode_policy(policy)?;
        self.write_primary(|txn| {
            if txn.get(self.policy_db, policy.name.as_bytes())?.is_none() {
                return Err(Error::NoEntry);
            }
            Ok(txn.put(self.policy_db, policy.name.as_bytes(), &value, WriteFlags::empty())?)
        })
    }

    fn iterate_policies(&self, func: PolicyCallback<'_>) -> Result<()> {
        let txn = self.env.begin_ro_txn()?;
        let cursor = txn.open_ro_cursor(self.policy_db)?;
        let mut item = cursor_get(&cursor, ffi::MDB_FIRST)?;
        while let Some((key, value)) = item {
            func(&marshal::decode_policy(key, value)?)?;
            item = cursor_get(&cursor, ffi::MDB_NEXT)?;
        }
        Ok(())
    }

    fn delete_policy(&self, name: &str) -> Result<()> {
        self.write_primary(|txn| not_found_as_no_entry(txn.del(self.policy_db, name.as_bytes())))
    }

    fn update_lockout(&self, entry: &PrincipalEntry) -> Result<()> {
        self.store_lockout(entry.name.unparse().as_bytes(), entry)
    }

    fn promote(&self) -> Result<()> {
        let txn = self.load_txn.borrow_mut().take().ok_or(Error::NoLoadInProgress)?;
        txn.commit()?;
        if let Some(txn) = self.load_lockout_txn.borrow_mut().take() {
            txn.commit()?;
        }
        log::info!("promoted loaded database {}", self.path.display());
        Ok(())
    }

    fn check_policy_as(&self, ctx: &Context, client: &PrincipalEntry, now: u32) -> Result<()> {
        lockout::check_policy_as(ctx, self, client, now)
    }

    fn audit_as_req(
        &self,
        ctx: &Context,
        client: &PrincipalEntry,
        now: u32,
        status: AuthStatus,
    ) -> Result<()> {
        lockout::audit_as_req(ctx, self, client, now, status)
    }
}
