//! Legacy file-based storage backend
//!
//! Principals live in `<dbname>`, guarded by the lock file `<dbname>.ok` whose modification time
//! is the database age. Policies live in `<dbname>.kadm5`, guarded by `<dbname>.kadm5.lock`.
//! Bulk loads write to a temporary database named `<dbname>~` which [`KdbBackend::promote`]
//! renames over the live one.
//!
//! Handles of this module are serialized by a process-wide mutex, released while iteration
//! callbacks run.

use std::{
    cell::RefCell,
    io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};

use crate::{
    backend::{IterFlags, KdbBackend, KdbModule, NameFilter, PolicyCallback, PrincipalCallback},
    codec::legacy,
    context::Context,
    db_args::DbOptions,
    error::{Error, Result},
    fs,
    lock::{create_lock_file, LockFile, LockMode},
    lockout::{self, AuthStatus},
    name::PrincipalName,
    params::{suffixed, Params},
    policy::PolicyEntry,
    principal::PrincipalEntry,
};

mod engine;

use engine::{DbKind, LockedDb};

static DB2_MUTEX: Mutex<()> = Mutex::new(());

fn serialize() -> Result<MutexGuard<'static, ()>> {
    DB2_MUTEX.lock().map_err(|_| Error::LockError)
}

/// The `db2` module
#[derive(Copy, Clone, Debug, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct Db2Module;

/// Files of a database
#[derive(Clone, Debug)]
struct Db2Paths {
    data: PathBuf,
    data_lock: PathBuf,
    policy: PathBuf,
    policy_lock: PathBuf,
}

impl Db2Paths {
    fn new(params: &Params, options: &DbOptions, temporary: bool) -> Self {
        let dbname = options
            .dbname
            .as_deref()
            .unwrap_or_else(|| params.dbname());
        let base = if temporary {
            suffixed(dbname, "~")
        } else {
            dbname.to_path_buf()
        };
        Self {
            data_lock: suffixed(&base, ".ok"),
            policy: suffixed(&base, ".kadm5"),
            policy_lock: suffixed(&base, ".kadm5.lock"),
            data: base,
        }
    }

    fn all(&self) -> [&Path; 4] {
        [&self.data, &self.data_lock, &self.policy, &self.policy_lock]
    }
}

fn principal_key(name: &PrincipalName) -> Vec<u8> {
    let mut key = name.unparse().into_bytes();
    key.push(0);
    key
}

fn policy_key(name: &str) -> Vec<u8> {
    let mut key = name.as_bytes().to_vec();
    key.push(0);
    key
}

fn accepts(filter: NameFilter<'_>, key: &[u8]) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let name = key.strip_suffix(&[0]).unwrap_or(key);
    std::str::from_utf8(name).is_ok_and(filter)
}

impl KdbModule for Db2Module {
    fn name(&self) -> &'static str {
        "db2"
    }

    fn open(&self, params: &Params, options: &DbOptions) -> Result<Box<dyn KdbBackend>> {
        let paths = Db2Paths::new(params, options, options.temporary);
        if !paths.data.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("database {} does not exist", paths.data.display()),
            )
            .into());
        }
        let backend = Db2Backend::new(params, options, paths)?;
        if options.temporary {
            backend.begin_load()?;
        }
        Ok(Box::new(backend))
    }

    fn create(&self, params: &Params, options: &DbOptions) -> Result<Box<dyn KdbBackend>> {
        let paths = Db2Paths::new(params, options, options.temporary);
        if options.temporary {
            // Leftovers of an interrupted load
            for path in paths.all() {
                fs::remove_if_exists(path)?;
            }
        }
        let kind = if options.hash {
            DbKind::Hash
        } else {
            DbKind::Btree
        };
        engine::create_file(&paths.data, kind)?;
        engine::create_file(&paths.policy, DbKind::Btree)?;
        create_lock_file(&paths.data_lock)?;
        create_lock_file(&paths.policy_lock)?;
        log::info!("created {kind} database {}", paths.data.display());

        let backend = Db2Backend::new(params, options, paths)?;
        if options.temporary {
            backend.begin_load()?;
        }
        Ok(Box::new(backend))
    }

    fn destroy(&self, params: &Params, options: &DbOptions) -> Result<()> {
        let paths = Db2Paths::new(params, options, options.temporary);
        fs::destroy_file(&paths.data)?;
        fs::remove_if_exists(&paths.data_lock)?;
        fs::destroy_file(&paths.policy)?;
        fs::remove_if_exists(&paths.policy_lock)?;
        log::info!("destroyed database {}", paths.data.display());
        Ok(())
    }
}

/// An open legacy database
pub struct Db2Backend {
    principals: LockedDb,
    policies: LockedDb,
    /// Files of the live database while this handle is a bulk load target
    live: RefCell<Option<Db2Paths>>,
    merge_nra: bool,
    unlockiter: bool,
}

impl Db2Backend {
    fn new(params: &Params, options: &DbOptions, paths: Db2Paths) -> Result<Self> {
        let kind = if options.hash {
            DbKind::Hash
        } else {
            DbKind::Btree
        };
        let live = options
            .temporary
            .then(|| Db2Paths::new(params, options, false));
        Ok(Self {
            principals: LockedDb::new(paths.data, paths.data_lock, kind)?,
            policies: LockedDb::new(paths.policy, paths.policy_lock, DbKind::Btree)?,
            live: RefCell::new(live),
            merge_nra: options.merge_nra,
            unlockiter: options.unlockiter.unwrap_or(params.unlockiter()),
        })
    }

    /// Lock a bulk load target for the lifetime of the handle
    fn begin_load(&self) -> Result<()> {
        let _guard = serialize()?;
        self.principals.lock(LockMode::Exclusive)?;
        if let Err(err) = self.policies.lock(LockMode::Exclusive) {
            self.principals.unlock()?;
            return Err(err);
        }
        log::info!("loading into {}", self.principals.path().display());
        Ok(())
    }

    fn iterate_locked(
        &self,
        guard: &mut Option<MutexGuard<'static, ()>>,
        filter: NameFilter<'_>,
        func: PrincipalCallback<'_>,
        mode: LockMode,
        reverse: bool,
    ) -> Result<()> {
        let mut after: Option<Vec<u8>> = None;
        while let Some((key, value)) = self.principals.next_record(after.as_deref(), reverse)? {
            if accepts(filter, &key) {
                let mut entry = legacy::decode_principal(&value)?;
                entry.sort_key_data();

                *guard = None;
                if self.unlockiter {
                    self.principals.unlock()?;
                }
                let result = func(&entry);
                *guard = Some(serialize()?);
                if self.unlockiter {
                    self.principals.lock(mode)?;
                }
                result?;
            }
            after = Some(key);
        }
        Ok(())
    }

    /// Copy the lockout state of the live database into the loaded entries
    fn merge_live_lockout(&self, live: &Path) -> Result<()> {
        let records = match engine::probe_file(live, DbKind::Btree) {
            Ok((_, records)) => records,
            Err(Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        self.principals.write(|loaded| {
            for (key, value) in loaded.iter_mut() {
                let Some(current) = records.get(key) else {
                    continue;
                };
                let current = legacy::decode_principal(current)?;
                let mut entry = legacy::decode_principal(value)?;
                entry.last_success = current.last_success;
                entry.last_failed = current.last_failed;
                entry.fail_auth_count = current.fail_auth_count;
                entry
                    .tl_data
                    .set_last_admin_unlock(current.tl_data.last_admin_unlock()?);
                *value = legacy::encode_principal(&entry)?;
            }
            Ok(())
        })?;
        self.principals.sync()
    }

    /// Replace the live files by the loaded ones, with the live database permanently locked
    fn swap_in(&self, live: &Db2Paths) -> Result<()> {
        if self.merge_nra {
            self.merge_live_lockout(&live.data)?;
        }
        self.principals.sync()?;
        self.policies.sync()?;

        let (data, data_lock) = (self.principals.path(), self.principals.lock_path());
        let (policy, policy_lock) = (self.policies.path(), self.policies.lock_path());
        self.principals.discard()?;
        self.policies.discard()?;
        std::fs::rename(&data, &live.data)?;
        std::fs::rename(&policy, &live.policy)?;
        fs::remove_if_exists(&data_lock)?;
        fs::remove_if_exists(&policy_lock)?;
        Ok(())
    }
}

impl KdbBackend for Db2Backend {
    fn get_age(&self) -> Result<DateTime<Utc>> {
        fs::mtime(&self.principals.lock_path())
    }

    fn lock(&self, mode: LockMode) -> Result<()> {
        let _guard = serialize()?;
        self.principals.lock(mode)?;
        if let Err(err) = self.policies.lock(mode) {
            self.principals.unlock()?;
            return Err(err);
        }
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        let _guard = serialize()?;
        let policies = self.policies.unlock();
        self.principals.unlock()?;
        policies
    }

    fn get_principal(&self, name: &PrincipalName) -> Result<PrincipalEntry> {
        let _guard = serialize()?;
        let key = principal_key(name);
        let value = self
            .principals
            .read(|records| Ok(records.get(&key).cloned()))?
            .ok_or(Error::NoEntry)?;
        let mut entry = legacy::decode_principal(&value)?;
        entry.sort_key_data();
        Ok(entry)
    }

    fn put_principal(&self, entry: &PrincipalEntry) -> Result<()> {
        let _guard = serialize()?;
        let key = principal_key(&entry.name);
        let value = legacy::encode_principal(entry)?;
        self.principals.write(|records| {
            records.insert(key, value);
            Ok(())
        })
    }

    fn delete_principal(&self, name: &PrincipalName) -> Result<()> {
        let _guard = serialize()?;
        let key = principal_key(name);
        self.principals
            .write(|records| records.remove(&key).map(|_| ()).ok_or(Error::NoEntry))
    }

    fn iterate_principals(
        &self,
        filter: NameFilter<'_>,
        func: PrincipalCallback<'_>,
        flags: IterFlags,
    ) -> Result<()> {
        let mode = if flags.contains(IterFlags::Write) {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        let mut guard = Some(serialize()?);
        self.principals.lock(mode)?;
        let result = self.iterate_locked(
            &mut guard,
            filter,
            func,
            mode,
            flags.contains(IterFlags::Reverse),
        );
        if guard.is_none() {
            guard = Some(serialize()?);
        }
        let unlocked = self.principals.unlock();
        drop(guard);
        result?;
        unlocked
    }

    fn create_policy(&self, policy: &PolicyEntry) -> Result<()> {
        let _guard = serialize()?;
        let key = policy_key(&policy.name);
        let value = legacy::encode_policy_record(policy)?;
        self.policies.write(|records| {
            if records.contains_key(&key) {
                return Err(Error::DuplicateEntry);
            }
            records.insert(key, value);
            Ok(())
        })
    }

    fn get_policy(&self, name: &str) -> Result<PolicyEntry> {
        let _guard = serialize()?;
        let key = policy_key(name);
        let value = self
            .policies
            .read(|records| Ok(records.get(&key).cloned()))?
            .ok_or(Error::NoEntry)?;
        legacy::decode_policy_record(&value)
    }

    fn put_policy(&self, policy: &PolicyEntry) -> Result<()> {
        let _guard = serialize()?;
        let key = policy_key(&policy.name);
        let value = legacy::encode_policy_record(policy)?;
        self.policies.write(|records| match records.get_mut(&key) {
            Some(stored) => {
                *stored = value;
                Ok(())
            }
            None => Err(Error::NoEntry),
        })
    }

    fn iterate_policies(&self, func: PolicyCallback<'_>) -> Result<()> {
        let mut guard = Some(serialize()?);
        self.policies.lock(LockMode::Shared)?;
        let mut result = Ok(());
        let mut after: Option<Vec<u8>> = None;
        loop {
            let record = match self.policies.next_record(after.as_deref(), false) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };
            let policy = match legacy::decode_policy_record(&record.1) {
                Ok(policy) => policy,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };
            drop(guard.take());
            result = func(&policy);
            guard = Some(serialize()?);
            if result.is_err() {
                break;
            }
            after = Some(record.0);
        }
        let unlocked = self.policies.unlock();
        drop(guard);
        result?;
        unlocked
    }

    fn delete_policy(&self, name: &str) -> Result<()> {
        let _guard = serialize()?;
        let key = policy_key(name);
        self.policies
            .write(|records| records.remove(&key).map(|_| ()).ok_or(Error::NoEntry))
    }

    fn promote(&self) -> Result<()> {
        let _guard = serialize()?;
        let live = self.live.borrow().clone().ok_or(Error::NoLoadInProgress)?;

        // A first load has no live lock files yet
        for path in [&live.data_lock, &live.policy_lock] {
            if !path.exists() {
                create_lock_file(path)?;
            }
        }
        let data_lock = LockFile::get(&live.data_lock)?;
        let policy_lock = LockFile::get(&live.policy_lock)?;
        data_lock.lock(LockMode::Permanent)?;
        if let Err(err) = policy_lock.lock(LockMode::Permanent) {
            data_lock.unlock()?;
            return Err(err);
        }

        let result = self.swap_in(&live);
        let policy_unlocked = policy_lock.unlock();
        data_lock.unlock()?;
        policy_unlocked?;
        result?;

        fs::touch(&live.data_lock)?;
        self.principals
            .retarget(live.data.clone(), live.data_lock.clone())?;
        self.policies
            .retarget(live.policy.clone(), live.policy_lock.clone())?;
        *self.live.borrow_mut() = None;
        log::info!("promoted loaded database {}", live.data.display());
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

impl Drop for Db2Backend {
    fn drop(&mut self) {
        let loading = self.live.borrow().is_some();
        let result = if loading {
            log::debug!(
                "abandoning load into {}",
                self.principals.path().display()
            );
            self.principals
                .discard()
                .and_then(|()| self.policies.discard())
        } else {
            let mut result = Ok(());
            for db in [&self.principals, &self.policies] {
                while result.is_ok() && db.depth() > 0 {
                    result = db.unlock();
                }
            }
            result
        };
        if let Err(err) = result {
            log::error!("failed to release database locks: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(dir: &Path) -> Params {
        Params::builder("EXAMPLE.COM")
            .module("db2")
            .dbname(dir.join("principal"))
            .build()
            .unwrap()
    }

    fn name(s: &str) -> PrincipalName {
        PrincipalName::parse(s, Some("EXAMPLE.COM")).unwrap()
    }

    #[test]
    fn create_refuses_existing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let params = params(dir.path());
        drop(Db2Module.create(&params, &DbOptions::default())?);
        assert!(dir.path().join("principal.ok").exists());
        assert!(dir.path().join("principal.kadm5.lock").exists());
        assert!(matches!(
            Db2Module.create(&params, &DbOptions::default()),
            Err(Error::Io(_))
        ));
        Ok(())
    }

    #[test]
    fn records_keep_lockout_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Db2Module.create(&params(dir.path()), &DbOptions::default())?;
        let mut entry = PrincipalEntry::new(name("alice"));
        entry.fail_auth_count = 2;
        entry.last_failed = 1000;
        db.put_principal(&entry)?;
        assert_eq!(db.get_principal(&name("alice"))?, entry);
        Ok(())
    }

    #[test]
    fn accepts_strips_terminator() {
        let filter = |name: &str| name == "alice@EXAMPLE.COM";
        assert!(accepts(Some(&filter), b"alice@EXAMPLE.COM\0"));
        assert!(!accepts(Some(&filter), b"bob@EXAMPLE.COM\0"));
        assert!(accepts(None, b"bob@EXAMPLE.COM\0"));
    }

    #[test]
    fn promote_requires_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Db2Module.create(&params(dir.path()), &DbOptions::default())?;
        assert!(matches!(db.promote(), Err(Error::NoLoadInProgress)));
        Ok(())
    }
}
