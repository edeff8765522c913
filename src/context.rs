//! Manage [database contexts][`Context`]

use std::cell::RefCell;

use crate::{
    crypto::{Crypto, MasterKey, MasterKeyList, SoftCrypto},
    params::Params,
};

/// State shared by a database handle and its backend
///
/// A context is not thread safe. Create one per thread.
pub struct Context {
    params: Params,
    crypto: Box<dyn Crypto>,
    /// Key used to load `master_keys`
    master_key: RefCell<Option<MasterKey>>,
    master_keys: RefCell<MasterKeyList>,
}

impl Context {
    /// Create a context using the pure-Rust crypto provider
    pub fn new(params: Params) -> Self {
        Self::with_crypto(params, Box::new(SoftCrypto))
    }

    /// Create a context using `crypto`
    pub fn with_crypto(params: Params, crypto: Box<dyn Crypto>) -> Self {
        Self {
            params,
            crypto,
            master_key: RefCell::new(None),
            master_keys: RefCell::new(MasterKeyList::default()),
        }
    }

    /// Parameters
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Crypto provider
    pub fn crypto(&self) -> &dyn Crypto {
        self.crypto.as_ref()
    }

    /// Cached master key list
    pub fn master_keys(&self) -> MasterKeyList {
        self.master_keys.borrow().clone()
    }

    /// Key the master key list was loaded with
    pub fn master_key(&self) -> Option<MasterKey> {
        self.master_key.borrow().clone()
    }

    /// Replace the cached master keys
    pub fn set_master_keys(&self, mkey: MasterKey, list: MasterKeyList) {
        *self.master_key.borrow_mut() = Some(mkey);
        *self.master_keys.borrow_mut() = list;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("params", &self.params)
            .field("master_keys", &self.master_keys.borrow().keys().len())
            .finish_non_exhaustive()
    }
}
