//! Long-lived LMDB transactions owned by a backend handle

use std::{
    ffi::{c_uint, c_void},
    ptr::null_mut,
};

use lmdb::{Database, Environment, WriteFlags};
use lmdb_sys as ffi;

fn check(code: i32) -> lmdb::Result<()> {
    if code == ffi::MDB_SUCCESS {
        Ok(())
    } else {
        Err(lmdb::Error::from_err_code(code))
    }
}

fn val(bytes: &[u8]) -> ffi::MDB_val {
    ffi::MDB_val {
        mv_size: bytes.len(),
        mv_data: bytes.as_ptr().cast_mut().cast::<c_void>(),
    }
}

/// A transaction that isn't tied to the lifetime of a borrowed [`Environment`]
///
/// The owner must drop it before the environment it was started in.
pub(super) struct RawTxn {
    txn: *mut ffi::MDB_txn,
}

impl RawTxn {
    /// Begin a read-write transaction
    pub(super) fn begin_rw(env: &Environment) -> lmdb::Result<Self> {
        Self::begin(env, 0)
    }

    /// Begin a read-only transaction
    pub(super) fn begin_ro(env: &Environment) -> lmdb::Result<Self> {
        Self::begin(env, ffi::MDB_RDONLY)
    }

    fn begin(env: &Environment, flags: c_uint) -> lmdb::Result<Self> {
        let mut txn = null_mut();
        // SAFETY: `env.env()` is a valid open environment, and `txn` receives the new handle.
        check(unsafe { ffi::mdb_txn_begin(env.env(), null_mut(), flags, &mut txn) })?;
        Ok(Self { txn })
    }

    /// Copy of the value stored under `key`
    pub(super) fn get(&self, db: Database, key: &[u8]) -> lmdb::Result<Option<Vec<u8>>> {
        let mut key = val(key);
        let mut data = ffi::MDB_val {
            mv_size: 0,
            mv_data: null_mut(),
        };
        // SAFETY: the transaction is active; LMDB only reads through `key`.
        match unsafe { ffi::mdb_get(self.txn, db.dbi(), &mut key, &mut data) } {
            ffi::MDB_NOTFOUND => Ok(None),
            code => {
                check(code)?;
                // SAFETY: `data` points into the map and stays valid until the transaction ends.
                let value =
                    unsafe { std::slice::from_raw_parts(data.mv_data.cast::<u8>(), data.mv_size) };
                Ok(Some(value.to_vec()))
            }
        }
    }

    /// Store `value` under `key`
    pub(super) fn put(
        &mut self,
        db: Database,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> lmdb::Result<()> {
        let mut key = val(key);
        let mut data = val(value);
        // SAFETY: the transaction is an active write transaction; LMDB copies both values.
        check(unsafe { ffi::mdb_put(self.txn, db.dbi(), &mut key, &mut data, flags.bits()) })
    }

    /// Remove `key`
    pub(super) fn del(&mut self, db: Database, key: &[u8]) -> lmdb::Result<()> {
        let mut key = val(key);
        // SAFETY: the transaction is an active write transaction.
        check(unsafe { ffi::mdb_del(self.txn, db.dbi(), &mut key, null_mut()) })
    }

    /// Remove every record of `db`
    pub(super) fn clear(&mut self, db: Database) -> lmdb::Result<()> {
        // SAFETY: the transaction is an active write transaction; 0 empties without closing.
        check(unsafe { ffi::mdb_drop(self.txn, db.dbi(), 0) })
    }

    /// Commit the transaction
    pub(super) fn commit(mut self) -> lmdb::Result<()> {
        let txn = std::mem::replace(&mut self.txn, null_mut());
        // SAFETY: `txn` is active and is freed by the commit, whatever its result.
        check(unsafe { ffi::mdb_txn_commit(txn) })
    }

    /// Release the snapshot of a read-only transaction, keeping its handle for [`Self::renew`]
    pub(super) fn reset(&mut self) {
        // SAFETY: only called on read-only transactions.
        unsafe { ffi::mdb_txn_reset(self.txn) };
    }

    /// Take a fresh snapshot after [`Self::reset`]
    pub(super) fn renew(&mut self) -> lmdb::Result<()> {
        // SAFETY: only called on read-only transactions that were reset.
        check(unsafe { ffi::mdb_txn_renew(self.txn) })
    }
}

impl Drop for RawTxn {
    fn drop(&mut self) {
        if !self.txn.is_null() {
            // SAFETY: uncommitted transactions, active or reset, are aborted exactly once.
            unsafe { ffi::mdb_txn_abort(self.txn) };
        }
    }
}
