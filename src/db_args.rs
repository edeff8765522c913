//! Define [`DbArgs`] to pass to database backends

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Backend-specific `key[=value]` arguments
///
/// ```
/// use kdb5::DbArgs;
///
/// let db_args = DbArgs::builder()
///     .arg("temporary", None)
///     .arg("dbname", Some("/tmp/principal"))
///     .build();
/// assert!(db_args.options().unwrap().temporary);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DbArgs {
    args: Vec<(String, Option<String>)>,
}

impl DbArgs {
    /// Construct a new [`DbArgsBuilder`]
    pub fn builder() -> DbArgsBuilder {
        DbArgsBuilder::default()
    }

    /// Parse arguments in their `key[=value]` string form
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args = args
            .into_iter()
            .map(|arg| match arg.as_ref().split_once('=') {
                Some((key, value)) => (key.to_owned(), Some(value.to_owned())),
                None => (arg.as_ref().to_owned(), None),
            })
            .collect();
        Self { args }
    }

    /// Raw arguments
    pub fn args(&self) -> &[(String, Option<String>)] {
        &self.args
    }

    /// Interpret the arguments understood by the builtin backends
    pub fn options(&self) -> Result<DbOptions> {
        let mut options = DbOptions::default();
        for (key, value) in &self.args {
            match (key.as_str(), value) {
                ("temporary", None) => options.temporary = true,
                ("merge_nra", None) => options.merge_nra = true,
                ("hash", None) => options.hash = true,
                ("lockiter", None) => options.unlockiter = Some(false),
                ("unlockiter", None) => options.unlockiter = Some(true),
                ("dbname", Some(dbname)) => options.dbname = Some(PathBuf::from(dbname)),
                (key, Some(value)) => return Err(Error::BadDbArgs(format!("{key}={value}"))),
                (key, None) => return Err(Error::BadDbArgs(key.to_owned())),
            }
        }
        Ok(options)
    }
}

/// [`DbArgs`] builder
#[derive(Clone, Debug, Default)]
pub struct DbArgsBuilder {
    args: Vec<(String, Option<String>)>,
}

impl DbArgsBuilder {
    /// Add an argument with an optional value
    pub fn arg(mut self, key: &str, value: Option<&str>) -> Self {
        self.args.push((key.to_owned(), value.map(str::to_owned)));
        self
    }

    /// Build the [`DbArgs`]
    pub fn build(self) -> DbArgs {
        DbArgs { args: self.args }
    }
}

/// Options recognized in [`DbArgs`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct DbOptions {
    /// Open or create the database as the target of a bulk load
    pub temporary: bool,
    /// Keep the lockout state of the live database when promoting
    pub merge_nra: bool,
    /// Create legacy databases with the hash engine
    pub hash: bool,
    /// Override the configured iteration locking, `Some(true)` to release locks around callbacks
    pub unlockiter: Option<bool>,
    /// Override the configured database path
    pub dbname: Option<PathBuf>,
}
