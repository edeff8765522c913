//! Pluggable Kerberos principal database
//!
//! This crate stores Kerberos principals and password policies, with their keys encrypted under
//! a master key. Storage is provided by modules:
//!
//! - `klmdb`, the default, stores entries in LMDB and keeps lockout attributes in a separate
//!   environment
//! - `db2`, a legacy flat-file engine, keeps principals and policies in two lock-protected files
//!
//! Modules are looked up by name in the [`registry`], and additional ones can be registered at
//! runtime.
//!
//! ```no_run
//! use kdb5::{Kdb, Params, PolicyEntry};
//!
//! let params = Params::builder("EXAMPLE.COM")
//!     .dbname("/var/lib/krb5kdc/principal")
//!     .build()
//!     .unwrap();
//! let kdb = Kdb::builder(params).open().unwrap();
//!
//! kdb.create_policy(&PolicyEntry::builder("default").max_fail(3).build().unwrap())
//!     .unwrap();
//! dbg!("{}", kdb.list_principals(None).unwrap());
//! ```
//!
//! With [`Params::iprop_enabled`], every principal change is recorded in a memory-mapped
//! [update log](ulog) from which replicas can be kept up to date.
//!
//! # About thread safety
//!
//! Database handles are neither `Send` nor `Sync`. Open one [`Kdb`] per thread. Handles of the
//! same process and of other processes coordinate through file locks.

#![cfg_attr(docsrs, feature(doc_cfg))]

mod conv;
mod fs;

pub mod error;
pub use error::Error;

pub mod params;
pub use params::Params;

pub mod db_args;
pub use db_args::DbArgs;

pub mod context;
pub use context::Context;

pub mod name;
pub use name::PrincipalName;

pub mod keysalt;
pub use keysalt::{EncryptionType, KeySalt, KeySalts, SaltType};

pub mod key_data;
pub use key_data::KeyData;

pub mod tl_data;
pub use tl_data::{TlData, TlDataEntry};

pub mod principal;
pub use principal::{PrincipalAttributes, PrincipalEntry};

pub mod policy;
pub use policy::PolicyEntry;

pub mod codec;

pub mod crypto;
pub use crypto::{Crypto, MasterKey, MasterKeyList};

pub mod sys;

pub mod lock;
pub use lock::LockMode;

pub mod master_key;

pub mod backend;
pub use backend::{IterFlags, KdbBackend, KdbModule};

pub mod lockout;
pub use lockout::AuthStatus;

pub mod klmdb;

pub mod db2;

pub mod ulog;
pub use ulog::Ulog;

pub mod registry;

pub mod kdb;
pub use kdb::{Kdb, KdbBuilder};
