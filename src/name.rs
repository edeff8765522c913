//! Structured Kerberos principal names

use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

/// A Kerberos principal name: a list of components and a realm
///
/// The textual form is `comp1/comp2@REALM`, where `/`, `@` and `\` inside a component are
/// escaped with a backslash.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrincipalName {
    components: Vec<String>,
    realm: String,
}

impl PrincipalName {
    /// Create a principal name from its parts
    pub fn new<S: Into<String>>(components: Vec<String>, realm: S) -> Result<Self> {
        if components.is_empty() {
            return Err(Error::BadPrincipalName("no components".to_owned()));
        }
        Ok(Self {
            components,
            realm: realm.into(),
        })
    }

    /// Parse an unparsed principal name
    ///
    /// `default_realm` is used when the name carries no `@REALM` part.
    pub fn parse(name: &str, default_realm: Option<&str>) -> Result<Self> {
        let mut components = Vec::new();
        let mut current = String::new();
        let mut realm: Option<String> = None;
        let mut chars = name.chars();

        while let Some(c) = chars.next() {
            let c = match c {
                '\\' => {
                    let escaped = chars
                        .next()
                        .ok_or_else(|| Error::BadPrincipalName(name.to_owned()))?;
                    match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'b' => '\u{8}',
                        '0' => '\0',
                        other => other,
                    }
                }
                '/' if realm.is_none() => {
                    components.push(std::mem::take(&mut current));
                    continue;
                }
                '@' => {
                    if realm.is_some() {
                        return Err(Error::BadPrincipalName(name.to_owned()));
                    }
                    components.push(std::mem::take(&mut current));
                    realm = Some(String::new());
                    continue;
                }
                other => other,
            };
            match realm.as_mut() {
                Some(realm) => realm.push(c),
                None => current.push(c),
            }
        }

        let realm = match realm {
            Some(realm) => realm,
            None => {
                components.push(current);
                default_realm
                    .map(ToOwned::to_owned)
                    .ok_or_else(|| Error::BadPrincipalName(name.to_owned()))?
            }
        };
        if realm.is_empty() {
            return Err(Error::BadPrincipalName(name.to_owned()));
        }
        Self::new(components, realm)
    }

    /// Name components
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Realm
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Unparsed textual form of the name
    pub fn unparse(&self) -> String {
        let mut out = String::new();
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            escape_into(&mut out, component, true);
        }
        out.push('@');
        escape_into(&mut out, &self.realm, false);
        out
    }

    /// Salt used for the `normal` salt type: realm followed by every component
    pub fn normal_salt(&self) -> Vec<u8> {
        let mut salt = self.realm.as_bytes().to_vec();
        salt.extend(self.components.iter().flat_map(|c| c.bytes()));
        salt
    }

    /// Salt used for the `norealm` salt type: every component, without the realm
    pub fn norealm_salt(&self) -> Vec<u8> {
        self.components.iter().flat_map(|c| c.bytes()).collect()
    }
}

fn escape_into(out: &mut String, s: &str, escape_slash: bool) {
    for c in s.chars() {
        match c {
            '/' if escape_slash => out.push_str("\\/"),
            '@' => out.push_str("\\@"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
}

impl FromStr for PrincipalName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, None)
    }
}

impl fmt::Display for PrincipalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unparse())
    }
}
