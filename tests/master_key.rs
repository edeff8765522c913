//! Test master keys and key data handling
use anyhow::Result;
use chrono::{TimeDelta, Utc};
use kdb5::{
    error::Error, master_key, EncryptionType, Kdb, KeySalts, MasterKey, Params, SaltType,
};
use serial_test::serial;
mod util;
use util::{entry, name, REALM};

fn params(dir: &std::path::Path, module: &str) -> Result<Params> {
    Ok(Params::builder(REALM)
        .module(module)
        .dbname(dir.join("principal"))
        .stash_file(dir.join("stash"))
        .build()?)
}

/// Create a database protected by a password-derived master key, stashed next to it
fn init(dir: &std::path::Path, module: &str) -> Result<MasterKey> {
    let kdb = Kdb::builder(params(dir, module)?).create()?;
    let mname = master_key::master_principal(kdb.params())?;
    let mkey = master_key::master_key_from_password(
        kdb.context().crypto(),
        &mname,
        EncryptionType::AES256_CTS_HMAC_SHA1_96,
        "master password",
        1,
    )?;
    kdb.add_master_principal(&mkey)?;
    kdb.store_master_key_list(&dir.join("stash"))?;
    Ok(mkey)
}

fn password_keys(module: &str) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mkey = init(dir.path(), module)?;

    let kdb = Kdb::builder(params(dir.path(), module)?).open()?;
    let stashed = kdb.fetch_master_key(None)?;
    assert_eq!(stashed, mkey);
    assert!(matches!(
        kdb.fetch_master_key(Some(7)),
        Err(Error::NoMasterKey)
    ));
    kdb.load_master_keys(&stashed)?;

    let keysalts: KeySalts = "aes256-cts-hmac-sha1-96:normal,aes128-cts-hmac-sha1-96:normal".parse()?;
    let mut alice = entry("alice");
    kdb.change_password(&mut alice, &keysalts, Some("secret"), None, false)?;
    assert_eq!(alice.key_data.len(), 2);
    assert_eq!(alice.kvno(), 1);
    kdb.put_principal(&alice)?;

    let alice = kdb.get_principal(&name("alice"))?;
    let mut start = 0;
    let kd = kdb.search_enctype(
        &alice,
        &mut start,
        Some(EncryptionType::AES128_CTS_HMAC_SHA1_96),
        None,
        None,
    )?;
    assert_eq!(start, 2);
    let (key, salt) = kdb.decrypt_key_data(None, kd)?;
    let expected = kdb.context().crypto().string_to_key(
        EncryptionType::AES128_CTS_HMAC_SHA1_96,
        b"secret",
        &name("alice").normal_salt(),
    )?;
    assert_eq!(key, expected);
    assert_eq!(salt.salttype, SaltType::NORMAL);

    // New keys go first, old ones are kept on request
    let mut alice = alice;
    kdb.change_password(&mut alice, &keysalts, None, None, true)?;
    let kvnos: Vec<u16> = alice.key_data.iter().map(|kd| kd.kvno).collect();
    assert_eq!(kvnos, vec![2, 2, 1, 1]);
    Ok(())
}

fn master_key_rollover(module: &str) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let old = init(dir.path(), module)?;

    let kdb = Kdb::builder(params(dir.path(), module)?).open()?;
    kdb.load_master_keys(&old)?;
    let keysalts: KeySalts = "aes256-cts-hmac-sha1-96".parse()?;
    let mut alice = entry("alice");
    kdb.change_password(&mut alice, &keysalts, Some("secret"), None, false)?;
    kdb.put_principal(&alice)?;

    let new = MasterKey {
        kvno: 2,
        key: kdb
            .context()
            .crypto()
            .make_random_key(EncryptionType::AES256_CTS_HMAC_SHA1_96)?,
    };
    let now = Utc::now();
    kdb.add_master_key(&new, now + TimeDelta::days(1))?;
    assert!(matches!(
        kdb.add_master_key(&new, now),
        Err(Error::DuplicateEntry)
    ));
    assert_eq!(kdb.active_master_key(now)?.kvno, 1);
    assert_eq!(kdb.active_master_key(now + TimeDelta::days(2))?.kvno, 2);
    kdb.store_master_key_list(&dir.path().join("stash"))?;
    drop(kdb);

    // The old key still unlocks every master key
    let kdb = Kdb::builder(params(dir.path(), module)?).open()?;
    kdb.load_master_keys(&old)?;
    assert_eq!(kdb.context().master_keys().keys().len(), 2);
    assert_eq!(kdb.fetch_master_key(None)?, new);

    let alice = kdb.get_principal(&name("alice"))?;
    let (key, _) = kdb.decrypt_key_data(None, &alice.key_data[0])?;
    let reencrypted = kdb.encrypt_key_data(&new, &key, None, 1)?;
    assert_eq!(kdb.decrypt_key_data(Some(&new), &reencrypted)?.0, key);
    assert!(kdb.decrypt_key_data(Some(&old), &reencrypted).is_err());
    Ok(())
}

#[test]
#[serial]
fn lmdb_password_keys() -> Result<()> {
    password_keys("klmdb")
}

#[test]
#[serial]
fn db2_password_keys() -> Result<()> {
    password_keys("db2")
}

#[test]
#[serial]
fn lmdb_master_key_rollover() -> Result<()> {
    master_key_rollover("klmdb")
}

#[test]
#[serial]
fn db2_master_key_rollover() -> Result<()> {
    master_key_rollover("db2")
}

#[test]
#[serial]
fn wrong_master_key() -> Result<()> {
    let dir = tempfile::tempdir()?;
    init(dir.path(), "klmdb")?;
    let kdb = Kdb::builder(params(dir.path(), "klmdb")?).open()?;
    let mname = master_key::master_principal(kdb.params())?;
    let wrong = master_key::master_key_from_password(
        kdb.context().crypto(),
        &mname,
        EncryptionType::AES256_CTS_HMAC_SHA1_96,
        "not the master password",
        1,
    )?;
    assert!(matches!(
        kdb.load_master_keys(&wrong),
        Err(Error::BadMasterKey)
    ));
    Ok(())
}
