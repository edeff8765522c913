//! Test the LMDB backend through [`Kdb`]
use anyhow::Result;
use kdb5::{
    error::Error, key_data::KeyDataBlock, DbArgs, EncryptionType, IterFlags, Kdb, KeyData,
    PolicyEntry,
};
use serial_test::serial;
mod util;
use util::{entry, name, names, params, random_string};

fn key(kvno: u16) -> KeyData {
    KeyData {
        kvno,
        key: KeyDataBlock {
            enctype: EncryptionType::AES256_CTS_HMAC_SHA1_96,
            contents: vec![kvno as u8; 8],
        },
        salt: None,
    }
}

#[test]
#[serial]
fn principal_lifecycle() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let kdb = Kdb::builder(params(dir.path(), "klmdb")?).create()?;
    assert_eq!(kdb.module_name(), "klmdb");

    let princname = random_string(16);
    let mut alice = entry(&princname);
    alice.max_life = 3600;
    alice.key_data = vec![key(1), key(3), key(2)];
    kdb.put_principal(&alice)?;
    assert!(kdb.principal_exists(&name(&princname))?);

    let stored = kdb.get_principal(&name(&princname))?;
    assert_eq!(stored.max_life, 3600);
    let kvnos: Vec<u16> = stored.key_data.iter().map(|kd| kd.kvno).collect();
    assert_eq!(kvnos, vec![3, 2, 1]);
    assert_eq!(stored.kvno(), 3);

    kdb.delete_principal(&name(&princname))?;
    assert!(!kdb.principal_exists(&name(&princname))?);
    assert!(matches!(
        kdb.delete_principal(&name(&princname)),
        Err(Error::NoEntry)
    ));
    assert!(matches!(
        kdb.get_principal(&name(&princname)),
        Err(Error::NoEntry)
    ));
    Ok(())
}

#[test]
#[serial]
fn open_missing_database() -> Result<()> {
    let dir = tempfile::tempdir()?;
    assert!(Kdb::builder(params(dir.path(), "klmdb")?).open().is_err());
    Ok(())
}

#[test]
#[serial]
fn policies() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let kdb = Kdb::builder(params(dir.path(), "klmdb")?).create()?;

    let policy = PolicyEntry::builder("default").min_length(8).build()?;
    kdb.create_policy(&policy)?;
    assert!(matches!(
        kdb.create_policy(&policy),
        Err(Error::DuplicateEntry)
    ));
    assert_eq!(kdb.get_policy("default")?, policy);

    let missing = PolicyEntry::builder("missing").build()?;
    assert!(matches!(kdb.put_policy(&missing), Err(Error::NoEntry)));

    let updated = PolicyEntry::builder("default").min_length(12).build()?;
    kdb.put_policy(&updated)?;
    assert_eq!(kdb.get_policy("default")?.pw_min_length, 12);

    kdb.create_policy(&PolicyEntry::builder("admins").build()?)?;
    assert_eq!(kdb.list_policies()?, vec!["admins", "default"]);

    kdb.delete_policy("admins")?;
    assert!(!kdb.policy_exists("admins")?);
    assert!(matches!(kdb.delete_policy("admins"), Err(Error::NoEntry)));
    Ok(())
}

#[test]
#[serial]
fn iteration_order_and_filter() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let kdb = Kdb::builder(params(dir.path(), "klmdb")?).create()?;
    for s in ["carol", "alice", "bob", "host/alice"] {
        kdb.put_principal(&entry(s))?;
    }
    assert_eq!(
        names(&kdb)?,
        vec![
            "alice@EXAMPLE.COM",
            "bob@EXAMPLE.COM",
            "carol@EXAMPLE.COM",
            "host/alice@EXAMPLE.COM",
        ]
    );

    let mut reversed = Vec::new();
    kdb.iterate_principals(
        None,
        &mut |entry| {
            reversed.push(entry.name.unparse());
            Ok(())
        },
        IterFlags::Reverse,
    )?;
    assert_eq!(reversed.first().map(String::as_str), Some("host/alice@EXAMPLE.COM"));
    assert_eq!(reversed.last().map(String::as_str), Some("alice@EXAMPLE.COM"));

    let hosts = |name: &str| name.starts_with("host/");
    let filtered = kdb.list_principals(Some(&hosts))?;
    assert_eq!(filtered, vec![name("host/alice")]);
    Ok(())
}

#[test]
#[serial]
fn unlocked_iteration_survives_deletes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db_args = DbArgs::builder().arg("unlockiter", None).build();
    let kdb = Kdb::builder(params(dir.path(), "klmdb")?)
        .db_args(db_args)
        .create()?;
    for s in ["a", "b", "c", "d"] {
        kdb.put_principal(&entry(s))?;
    }

    let mut seen = Vec::new();
    kdb.iterate_principals(
        None,
        &mut |entry| {
            seen.push(entry.name.unparse());
            kdb.delete_principal(&entry.name)
        },
        IterFlags::Write,
    )?;
    assert_eq!(seen.len(), 4);
    assert!(names(&kdb)?.is_empty());
    Ok(())
}

#[test]
#[serial]
fn callback_error_stops_iteration() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let kdb = Kdb::builder(params(dir.path(), "klmdb")?).create()?;
    for s in ["a", "b", "c"] {
        kdb.put_principal(&entry(s))?;
    }
    let mut calls = 0;
    let result = kdb.iterate_principals(
        None,
        &mut |_| {
            calls += 1;
            Err(Error::InUse)
        },
        IterFlags::empty(),
    );
    assert!(matches!(result, Err(Error::InUse)));
    assert_eq!(calls, 1);
    Ok(())
}

#[test]
#[serial]
fn load_is_invisible_until_promoted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let params = params(dir.path(), "klmdb")?;
    let live = Kdb::builder(params.clone()).create()?;
    live.put_principal(&entry("old"))?;

    let load = Kdb::builder(params)
        .db_args(DbArgs::builder().arg("temporary", None).build())
        .create()?;
    load.put_principal(&entry("new"))?;
    assert!(load.principal_exists(&name("new"))?);
    assert!(!load.principal_exists(&name("old"))?);

    assert!(live.principal_exists(&name("old"))?);
    assert!(!live.principal_exists(&name("new"))?);

    load.promote()?;
    assert!(live.principal_exists(&name("new"))?);
    assert!(!live.principal_exists(&name("old"))?);
    assert!(matches!(load.promote(), Err(Error::NoLoadInProgress)));
    Ok(())
}

#[test]
#[serial]
fn load_keeps_live_lockout_state() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let params = params(dir.path(), "klmdb")?;
    {
        let live = Kdb::builder(params.clone()).create()?;
        let mut alice = entry("alice");
        alice.fail_auth_count = 2;
        alice.last_failed = 1000;
        live.put_principal(&alice)?;
    }

    let load = Kdb::builder(params.clone())
        .db_args(
            DbArgs::builder()
                .arg("temporary", None)
                .arg("merge_nra", None)
                .build(),
        )
        .create()?;
    let mut alice = entry("alice");
    alice.max_life = 600;
    load.put_principal(&alice)?;
    load.promote()?;
    drop(load);

    let kdb = Kdb::builder(params).open()?;
    let stored = kdb.get_principal(&name("alice"))?;
    assert_eq!(stored.max_life, 600);
    assert_eq!((stored.fail_auth_count, stored.last_failed), (2, 1000));
    Ok(())
}

#[test]
#[serial]
fn rename_and_destroy() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let params = params(dir.path(), "klmdb")?;
    let kdb = Kdb::builder(params.clone()).create()?;
    kdb.put_principal(&entry("alice"))?;
    kdb.put_principal(&entry("bob"))?;

    assert!(matches!(
        kdb.rename_principal(&name("alice"), &name("bob")),
        Err(Error::InUse)
    ));
    kdb.rename_principal(&name("alice"), &name("carol"))?;
    assert_eq!(names(&kdb)?, vec!["bob@EXAMPLE.COM", "carol@EXAMPLE.COM"]);
    drop(kdb);

    Kdb::destroy(&params, None)?;
    assert!(!dir.path().join("principal.mdb").exists());
    assert!(!dir.path().join("principal.lockout.mdb").exists());
    Ok(())
}
