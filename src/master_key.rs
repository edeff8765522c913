//! Master key stash files and the master key principal

use std::{
    fs::OpenOptions,
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::Path,
};

use crate::{
    codec::{Reader, Writer},
    crypto::{decrypt_key_data, encrypt_key_data, Crypto, KeyBlock, MasterKey, MasterKeyList},
    error::{Error, Result},
    name::PrincipalName,
    params::{suffixed, Params},
    principal::{PrincipalAttributes, PrincipalEntry},
    tl_data::{ActKvno, MkeyAux},
    EncryptionType,
};

/// Maximum ticket life of the master key principal, in seconds
const MASTER_MAX_LIFE: u32 = 600;

/// Name of the master key principal configured in `params`
pub fn master_principal(params: &Params) -> Result<PrincipalName> {
    PrincipalName::parse(params.mkey_name(), Some(params.realm()))
}

/// Read every key of a stash file
pub fn read_stash(path: &Path) -> Result<Vec<MasterKey>> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(Error::NoMasterKey),
        Err(err) => return Err(err.into()),
    };
    let mut reader = Reader::new(&contents);
    let mut keys = Vec::new();
    while reader.remaining() > 0 {
        let kvno = reader.u32()?;
        let enctype = EncryptionType::from(i32::from(reader.u16()?));
        let length = reader.u32()? as usize;
        let key = reader.bytes(length)?.to_vec();
        keys.push(MasterKey {
            kvno,
            key: KeyBlock::new(enctype, key),
        });
    }
    Ok(keys)
}

/// Key `kvno` from a stash file, or the newest one
pub fn fetch_stashed_key(path: &Path, kvno: Option<u32>) -> Result<MasterKey> {
    let list = MasterKeyList::new(read_stash(path)?);
    let mkey = match kvno {
        Some(kvno) => list.find(kvno),
        None => list.newest(),
    };
    mkey.cloned().ok_or(Error::NoMasterKey)
}

/// Replace a stash file with `list`
pub fn write_stash(path: &Path, list: &MasterKeyList) -> Result<()> {
    let mut writer = Writer::with_capacity(64 * list.keys().len())?;
    for mkey in list.keys() {
        writer.u32(mkey.kvno);
        // Stash files carry 16-bit encryption types
        writer.u16(i32::from(mkey.key.enctype) as u16);
        writer.u32(
            mkey.key
                .contents
                .len()
                .try_into()
                .map_err(|_| Error::FieldTooLong)?,
        );
        writer.bytes(&mkey.key.contents);
    }
    let contents = zeroize::Zeroizing::new(writer.finish());

    let tmp = suffixed(path, ".tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)?;
    file.write_all(&contents)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    log::info!("stashed {} master keys in {}", list.keys().len(), path.display());
    Ok(())
}

/// Derive a master key from a password, salted with the master principal name
pub fn master_key_from_password(
    crypto: &dyn Crypto,
    mname: &PrincipalName,
    enctype: EncryptionType,
    password: &str,
    kvno: u32,
) -> Result<MasterKey> {
    let key = crypto.string_to_key(enctype, password.as_bytes(), &mname.normal_salt())?;
    Ok(MasterKey { kvno, key })
}

/// Decrypt every master key stored in the master key principal
///
/// `mkey` must decrypt either the newest key of the entry or one of its auxiliary copies.
pub fn unlock_master_keys(
    crypto: &dyn Crypto,
    master_entry: &PrincipalEntry,
    mkey: &MasterKey,
) -> Result<MasterKeyList> {
    let Some(newest) = master_entry.key_data.first() else {
        return Err(Error::NoMasterKey);
    };

    let mut current = None;
    if mkey.key.enctype == newest.enctype() {
        match decrypt_key_data(crypto, &mkey.key, newest) {
            Ok((key, _)) => current = Some(key),
            Err(err) => log::debug!("master key {} doesn't decrypt the newest key: {err}", mkey.kvno),
        }
    }
    if current.is_none() {
        for aux in master_entry.tl_data.mkey_aux()? {
            if let Ok((key, _)) = decrypt_key_data(crypto, &mkey.key, &aux.latest_mkey) {
                current = Some(key);
                break;
            }
        }
    }
    let current = current.ok_or(Error::BadMasterKey)?;

    let mut keys = Vec::with_capacity(master_entry.key_data.len());
    for (i, kd) in master_entry.key_data.iter().enumerate() {
        let key = if i == 0 {
            current.clone()
        } else {
            decrypt_key_data(crypto, &current, kd)?.0
        };
        keys.push(MasterKey {
            kvno: u32::from(kd.kvno),
            key,
        });
    }
    Ok(MasterKeyList::new(keys))
}

/// Build the master key principal entry protecting `mkey`
pub fn new_master_entry(
    crypto: &dyn Crypto,
    name: PrincipalName,
    mkey: &MasterKey,
    now: u32,
) -> Result<PrincipalEntry> {
    let kvno = u16::try_from(mkey.kvno).map_err(|_| Error::BadVersion(u16::MAX))?;
    let mut entry = PrincipalEntry::new(name);
    entry.attributes = PrincipalAttributes::DisallowAllTix;
    entry.max_life = MASTER_MAX_LIFE;
    entry.key_data = vec![encrypt_key_data(crypto, &mkey.key, &mkey.key, None, kvno)?];
    entry.tl_data.set_last_pwd_change(now);
    entry.tl_data.set_actkvno(&[ActKvno { kvno, act_time: now }])?;
    Ok(entry)
}

/// Add `new` as the newest key of a master key principal, activated at `act_time`
///
/// `keys` must hold every current master key. Existing keys are re-encrypted under `new`, and
/// each of them protects a copy of `new` so that older stashes can still unlock the database.
pub fn add_master_key(
    crypto: &dyn Crypto,
    master_entry: &mut PrincipalEntry,
    keys: &MasterKeyList,
    new: &MasterKey,
    act_time: u32,
) -> Result<()> {
    let new_kvno = u16::try_from(new.kvno).map_err(|_| Error::BadVersion(u16::MAX))?;
    if keys.find(new.kvno).is_some() {
        return Err(Error::DuplicateEntry);
    }

    let mut key_data = vec![encrypt_key_data(crypto, &new.key, &new.key, None, new_kvno)?];
    let mut aux = Vec::with_capacity(keys.keys().len());
    for old in keys.keys() {
        let old_kvno = u16::try_from(old.kvno).map_err(|_| Error::BadVersion(u16::MAX))?;
        key_data.push(encrypt_key_data(crypto, &new.key, &old.key, None, old_kvno)?);
        aux.push(MkeyAux {
            mkey_kvno: old_kvno,
            latest_mkey: encrypt_key_data(crypto, &old.key, &new.key, None, new_kvno)?,
        });
    }
    master_entry.key_data = key_data;
    master_entry.sort_key_data();
    master_entry.tl_data.set_mkey_aux(&aux)?;

    let mut actkvno = master_entry.tl_data.actkvno()?;
    actkvno.retain(|act| act.kvno != new_kvno);
    actkvno.push(ActKvno {
        kvno: new_kvno,
        act_time,
    });
    actkvno.sort_by_key(|act| act.act_time);
    master_entry.tl_data.set_actkvno(&actkvno)?;
    Ok(())
}
