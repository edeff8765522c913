//! Test incremental propagation through the update log
use std::path::Path;

use anyhow::Result;
use kdb5::{
    error::Error,
    tl_data::KRB5_TL_DB_ARGS,
    ulog::{IpropRole, LastEntry, Ulog, UpdateStatus},
    DbArgs, Kdb, Params,
};
use serial_test::serial;
mod util;
use util::{entry, name, REALM};

fn iprop_params(dir: &Path, module: &str) -> Result<Params> {
    Ok(Params::builder(REALM)
        .module(module)
        .dbname(dir.join("principal"))
        .iprop(true)
        .iprop_ulogsize(16)
        .build()?)
}

fn propagate(module: &str) -> Result<()> {
    let primary_dir = tempfile::tempdir()?;
    let replica_dir = tempfile::tempdir()?;
    let primary = Kdb::builder(iprop_params(primary_dir.path(), module)?).create()?;
    let replica = Kdb::builder(iprop_params(replica_dir.path(), module)?).create()?;
    replica.ulog_set_role(IpropRole::Replica)?;
    assert_eq!(primary.ulog_role()?, IpropRole::Primary);

    primary.put_principal(&entry("alice"))?;

    // Full resync: copy the database, then start from the primary's newest update
    let mut alice = primary.get_principal(&name("alice"))?;
    alice.fail_auth_count = 2;
    alice.last_failed = 1000;
    replica.put_principal(&alice)?;
    replica.ulog_set_last(&primary.ulog_get_last()?)?;
    assert_eq!(replica.ulog_get_last()?.sno, 1);

    let mut alice = primary.get_principal(&name("alice"))?;
    alice.max_life = 3600;
    primary.put_principal(&alice)?;
    primary.put_principal(&entry("bob"))?;
    primary.put_principal(&entry("carol"))?;
    primary.delete_principal(&name("carol"))?;
    assert_eq!(primary.ulog_get_last()?.sno, 5);

    let result = primary.ulog_get_entries(&replica.ulog_get_last()?)?;
    assert_eq!(result.status, UpdateStatus::Ok);
    let snos: Vec<u32> = result.updates.iter().map(|update| update.stamp.sno).collect();
    assert_eq!(snos, vec![2, 3, 4, 5]);
    assert!(result.updates[3].delete);

    replica.ulog_replay(&result.updates)?;
    assert_eq!(replica.ulog_get_last()?, primary.ulog_get_last()?);
    let alice = replica.get_principal(&name("alice"))?;
    assert_eq!(alice.max_life, 3600);
    assert_eq!((alice.fail_auth_count, alice.last_failed), (2, 1000));
    assert!(replica.principal_exists(&name("bob"))?);
    assert!(!replica.principal_exists(&name("carol"))?);

    let result = primary.ulog_get_entries(&replica.ulog_get_last()?)?;
    assert_eq!(result.status, UpdateStatus::Nil);
    assert!(result.updates.is_empty());
    Ok(())
}

#[test]
#[serial]
fn propagate_lmdb() -> Result<()> {
    propagate("klmdb")
}

#[test]
#[serial]
fn propagate_db2() -> Result<()> {
    propagate("db2")
}

#[test]
#[serial]
fn replay_skips_uncommitted_and_restarts_on_gaps() -> Result<()> {
    let primary_dir = tempfile::tempdir()?;
    let replica_dir = tempfile::tempdir()?;
    let replica_params = iprop_params(replica_dir.path(), "klmdb")?;
    let primary = Kdb::builder(iprop_params(primary_dir.path(), "klmdb")?).create()?;
    let replica = Kdb::builder(replica_params.clone()).create()?;
    replica.ulog_set_role(IpropRole::Replica)?;

    primary.put_principal(&entry("alice"))?;
    replica.put_principal(&entry("alice"))?;
    replica.ulog_set_last(&primary.ulog_get_last()?)?;
    primary.put_principal(&entry("bob"))?;
    primary.put_principal(&entry("carol"))?;

    let mut updates = primary.ulog_get_entries(&replica.ulog_get_last()?)?.updates;
    assert_eq!(updates.len(), 2);
    updates[0].committed = false;
    replica.ulog_replay(&updates[..1])?;
    assert!(!replica.principal_exists(&name("bob"))?);
    assert_eq!(replica.ulog_get_last()?.sno, 1);

    // Serial 3 doesn't follow 1: the local log starts over from it
    replica.ulog_replay(&updates[1..])?;
    assert!(replica.principal_exists(&name("carol"))?);
    assert_eq!(replica.ulog_get_last()?, primary.ulog_get_last()?);
    let header = Ulog::open(&replica_params.ulog_path(), 16, IpropRole::Replica)?.header();
    assert_eq!((header.num, header.first.sno, header.last.sno), (1, 3, 3));
    Ok(())
}

#[test]
#[serial]
fn unknown_replica_state_needs_resync() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let primary = Kdb::builder(iprop_params(dir.path(), "klmdb")?).create()?;
    primary.put_principal(&entry("alice"))?;
    let last = primary.ulog_get_last()?;

    let fresh = primary.ulog_get_entries(&LastEntry::default())?;
    assert_eq!(fresh.status, UpdateStatus::FullResync);

    let ahead = LastEntry { sno: 7, ..last };
    assert_eq!(
        primary.ulog_get_entries(&ahead)?.status,
        UpdateStatus::FullResync
    );

    // Same serial number, different history
    let reused = LastEntry {
        seconds: last.seconds.wrapping_sub(100),
        ..last
    };
    assert_eq!(
        primary.ulog_get_entries(&reused)?.status,
        UpdateStatus::FullResync
    );
    Ok(())
}

#[test]
#[serial]
fn database_arguments_are_not_stored() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let kdb = Kdb::builder(iprop_params(dir.path(), "klmdb")?).create()?;
    let mut alice = entry("alice");
    alice.tl_data.set(KRB5_TL_DB_ARGS, b"containerdn=ou=people\0".to_vec());
    kdb.put_principal(&alice)?;
    let stored = kdb.get_principal(&name("alice"))?;
    assert!(stored.tl_data.get(KRB5_TL_DB_ARGS).is_none());
    Ok(())
}

#[test]
#[serial]
fn logged_changes_restrictions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let kdb = Kdb::builder(iprop_params(dir.path(), "klmdb")?).create()?;
    kdb.put_principal(&entry("alice"))?;
    assert!(matches!(
        kdb.rename_principal(&name("alice"), &name("bob")),
        Err(Error::OperationNotSupported(_))
    ));
    // Deleting a missing principal logs nothing
    assert!(matches!(
        kdb.delete_principal(&name("bob")),
        Err(Error::NoEntry)
    ));
    assert_eq!(kdb.ulog_get_last()?.sno, 1);
    Ok(())
}

#[test]
#[serial]
fn no_log_without_iprop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let kdb = Kdb::builder(util::params(dir.path(), "klmdb")?).create()?;
    assert!(matches!(
        kdb.ulog_get_last(),
        Err(Error::OperationNotSupported(_))
    ));
    assert!(!dir.path().join("principal.ulog").exists());

    let params = iprop_params(dir.path(), "klmdb")?;
    let load = Kdb::builder(params)
        .db_args(DbArgs::builder().arg("temporary", None).build())
        .create()?;
    load.put_principal(&entry("alice"))?;
    assert!(load.ulog_get_last().is_err());
    Ok(())
}
