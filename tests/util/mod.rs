#![allow(dead_code)]

use std::path::Path;

use anyhow::Result;
use kdb5::{Kdb, Params, PrincipalEntry, PrincipalName};
use rand::{distr::Alphanumeric, Rng};

pub const REALM: &str = "EXAMPLE.COM";

pub fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn params(dir: &Path, module: &str) -> Result<Params> {
    Ok(Params::builder(REALM)
        .module(module)
        .dbname(dir.join("principal"))
        .build()?)
}

pub fn name(s: &str) -> PrincipalName {
    PrincipalName::parse(s, Some(REALM)).unwrap()
}

pub fn entry(s: &str) -> PrincipalEntry {
    PrincipalEntry::new(name(s))
}

/// Principal names in iteration order
pub fn names(kdb: &Kdb) -> Result<Vec<String>> {
    Ok(kdb
        .list_principals(None)?
        .iter()
        .map(PrincipalName::unparse)
        .collect())
}
