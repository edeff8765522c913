//! Test account lockout with both builtin backends
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use kdb5::{
    error::Error, tl_data::AdminData, AuthStatus, Kdb, PolicyEntry, PrincipalAttributes,
};
use serial_test::serial;
mod util;
use util::{entry, name, params};

fn setup(dir: &std::path::Path, module: &str) -> Result<Kdb> {
    let kdb = Kdb::builder(params(dir, module)?).create()?;
    kdb.create_policy(
        &PolicyEntry::builder("lockout")
            .max_fail(3)
            .lockout_duration(Some(Duration::from_secs(60)))
            .build()?,
    )?;
    let mut alice = entry("alice");
    alice.attributes = PrincipalAttributes::RequiresPreAuth;
    alice.tl_data.set_admin_data(&AdminData {
        policy: Some("lockout".to_owned()),
        aux_attributes: 0,
    })?;
    kdb.put_principal(&alice)?;
    Ok(kdb)
}

fn start() -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(1_700_000_000, 0).ok_or_else(|| anyhow::anyhow!("bad timestamp"))
}

fn fail(kdb: &Kdb, now: DateTime<Utc>) -> Result<()> {
    let alice = kdb.get_principal(&name("alice"))?;
    kdb.audit_as_req(&alice, now, AuthStatus::PreauthFailed)?;
    Ok(())
}

fn locked_after_failures(module: &str) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let kdb = setup(dir.path(), module)?;
    let now = start()?;

    for _ in 0..3 {
        kdb.check_policy_as(&kdb.get_principal(&name("alice"))?, now)?;
        fail(&kdb, now)?;
    }
    let alice = kdb.get_principal(&name("alice"))?;
    assert_eq!(alice.fail_auth_count, 3);
    assert!(matches!(
        kdb.check_policy_as(&alice, now + TimeDelta::seconds(59)),
        Err(Error::ClientRevoked)
    ));
    assert!(kdb.check_policy_tgs(&alice, now).is_ok());

    // Attempts while locked aren't counted
    fail(&kdb, now + TimeDelta::seconds(30))?;
    assert_eq!(kdb.get_principal(&name("alice"))?.fail_auth_count, 3);

    kdb.check_policy_as(&alice, now + TimeDelta::seconds(61))?;
    Ok(())
}

fn success_resets_count(module: &str) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let kdb = setup(dir.path(), module)?;
    let now = start()?;

    fail(&kdb, now)?;
    fail(&kdb, now)?;
    let alice = kdb.get_principal(&name("alice"))?;
    kdb.audit_as_req(&alice, now + TimeDelta::seconds(5), AuthStatus::Success)?;

    let alice = kdb.get_principal(&name("alice"))?;
    assert_eq!(alice.fail_auth_count, 0);
    assert_eq!(alice.last_success, 1_700_000_005);
    assert_eq!(alice.last_failed, 1_700_000_000);

    // Other failures don't count
    kdb.audit_as_req(&alice, now, AuthStatus::Failed)?;
    assert_eq!(kdb.get_principal(&name("alice"))?.fail_auth_count, 0);
    Ok(())
}

fn admin_unlock(module: &str) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let kdb = setup(dir.path(), module)?;
    let now = start()?;
    for _ in 0..3 {
        fail(&kdb, now)?;
    }

    let mut alice = kdb.get_principal(&name("alice"))?;
    alice
        .tl_data
        .set_last_admin_unlock(1_700_000_010);
    kdb.put_principal(&alice)?;
    let alice = kdb.get_principal(&name("alice"))?;
    kdb.check_policy_as(&alice, now + TimeDelta::seconds(20))?;

    // The count restarts after an unlock
    fail(&kdb, now + TimeDelta::seconds(20))?;
    assert_eq!(kdb.get_principal(&name("alice"))?.fail_auth_count, 1);
    Ok(())
}

fn failures_expire(module: &str) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let kdb = setup(dir.path(), module)?;
    kdb.put_policy(
        &PolicyEntry::builder("lockout")
            .max_fail(3)
            .lockout_duration(Some(Duration::from_secs(60)))
            .failcnt_interval(Some(Duration::from_secs(10)))
            .build()?,
    )?;
    let now = start()?;

    fail(&kdb, now)?;
    fail(&kdb, now + TimeDelta::seconds(5))?;
    assert_eq!(kdb.get_principal(&name("alice"))?.fail_auth_count, 2);

    // More than the interval since the last failure
    fail(&kdb, now + TimeDelta::seconds(16))?;
    let alice = kdb.get_principal(&name("alice"))?;
    assert_eq!(alice.fail_auth_count, 1);
    assert_eq!(alice.last_failed, 1_700_000_016);
    kdb.check_policy_as(&alice, now + TimeDelta::seconds(17))?;
    Ok(())
}

#[test]
#[serial]
fn lmdb_locked_after_failures() -> Result<()> {
    locked_after_failures("klmdb")
}

#[test]
#[serial]
fn lmdb_success_resets_count() -> Result<()> {
    success_resets_count("klmdb")
}

#[test]
#[serial]
fn lmdb_admin_unlock() -> Result<()> {
    admin_unlock("klmdb")
}

#[test]
#[serial]
fn db2_locked_after_failures() -> Result<()> {
    locked_after_failures("db2")
}

#[test]
#[serial]
fn db2_success_resets_count() -> Result<()> {
    success_resets_count("db2")
}

#[test]
#[serial]
fn db2_admin_unlock() -> Result<()> {
    admin_unlock("db2")
}

#[test]
#[serial]
fn lmdb_failures_expire() -> Result<()> {
    failures_expire("klmdb")
}

#[test]
#[serial]
fn db2_failures_expire() -> Result<()> {
    failures_expire("db2")
}

#[test]
#[serial]
fn disabled_lockout() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let params = kdb5::Params::builder(util::REALM)
        .dbname(dir.path().join("principal"))
        .disable_lockout(true)
        .build()?;
    let kdb = Kdb::builder(params).create()?;
    kdb.create_policy(&PolicyEntry::builder("lockout").max_fail(1).build()?)?;
    let mut alice = entry("alice");
    alice.tl_data.set_admin_data(&AdminData {
        policy: Some("lockout".to_owned()),
        aux_attributes: 0,
    })?;
    kdb.put_principal(&alice)?;

    let now = start()?;
    fail(&kdb, now)?;
    let alice = kdb.get_principal(&name("alice"))?;
    assert_eq!(alice.fail_auth_count, 0);
    kdb.check_policy_as(&alice, now)?;
    Ok(())
}

#[test]
#[serial]
fn disabled_lockout_keeps_failure_count() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let params = kdb5::Params::builder(util::REALM)
        .dbname(dir.path().join("principal"))
        .disable_lockout(true)
        .build()?;
    let kdb = Kdb::builder(params).create()?;
    let mut alice = entry("alice");
    alice.attributes = PrincipalAttributes::RequiresPreAuth;
    alice.fail_auth_count = 2;
    kdb.put_principal(&alice)?;

    let now = start()?;
    let alice = kdb.get_principal(&name("alice"))?;
    kdb.audit_as_req(&alice, now, AuthStatus::Success)?;
    let alice = kdb.get_principal(&name("alice"))?;
    assert_eq!(alice.fail_auth_count, 2);
    assert_eq!(alice.last_success, 1_700_000_000);
    Ok(())
}
