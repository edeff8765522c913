//! Password and lockout policies

use std::time::Duration;

use crate::{
    conv::{delta_to_dur, dur_to_delta},
    error::Result,
    tl_data::TlData,
};

/// A policy record, referenced by name from principals
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyEntry {
    /// Policy name
    pub name: String,
    /// Minimum password lifetime, in seconds
    pub pw_min_life: u32,
    /// Maximum password lifetime, in seconds
    pub pw_max_life: u32,
    /// Minimum password length
    pub pw_min_length: u32,
    /// Minimum number of character classes
    pub pw_min_classes: u32,
    /// Number of old keys kept for history checks
    pub pw_history_num: u32,
    /// Consecutive failures before lockout, 0 disables lockout
    pub pw_max_fail: u32,
    /// Failure count reset interval, in seconds, 0 never resets
    pub pw_failcnt_interval: u32,
    /// Lockout duration, in seconds, 0 locks until an administrative unlock
    pub pw_lockout_duration: u32,
    /// Policy attributes
    pub attributes: u32,
    /// Maximum ticket life override, in seconds
    pub max_life: u32,
    /// Maximum renewable ticket life override, in seconds
    pub max_renewable_life: u32,
    /// Allowed key/salt combinations
    pub allowed_keysalts: Option<String>,
    /// TL-data
    pub tl_data: TlData,
}

impl PolicyEntry {
    /// Construct a new [`PolicyBuilder`] for a policy with `name`
    pub fn builder(name: &str) -> PolicyBuilder {
        PolicyBuilder::new(name)
    }

    /// Lockout duration
    pub fn lockout_duration(&self) -> Option<Duration> {
        delta_to_dur(self.pw_lockout_duration)
    }

    /// Failure count reset interval
    pub fn failcnt_interval(&self) -> Option<Duration> {
        delta_to_dur(self.pw_failcnt_interval)
    }
}

/// Utility to create a [`PolicyEntry`]
#[derive(Clone, Debug)]
pub struct PolicyBuilder {
    entry: PolicyEntry,
    lockout_duration: Option<Duration>,
    failcnt_interval: Option<Duration>,
}

impl PolicyBuilder {
    fn new(name: &str) -> Self {
        Self {
            entry: PolicyEntry {
                name: name.to_owned(),
                ..Default::default()
            },
            lockout_duration: None,
            failcnt_interval: None,
        }
    }

    /// Set the number of consecutive failures before lockout
    pub fn max_fail(mut self, max_fail: u32) -> Self {
        self.entry.pw_max_fail = max_fail;
        self
    }

    /// Set the lockout duration
    ///
    /// `None` locks principals until an administrative unlock
    pub fn lockout_duration(mut self, duration: Option<Duration>) -> Self {
        self.lockout_duration = duration;
        self
    }

    /// Set the failure count reset interval
    pub fn failcnt_interval(mut self, interval: Option<Duration>) -> Self {
        self.failcnt_interval = interval;
        self
    }

    /// Set the minimum password length
    pub fn min_length(mut self, length: u32) -> Self {
        self.entry.pw_min_length = length;
        self
    }

    /// Set the allowed key/salt combinations
    pub fn allowed_keysalts(mut self, keysalts: Option<&str>) -> Self {
        self.entry.allowed_keysalts = keysalts.map(ToOwned::to_owned);
        self
    }

    /// Build the [`PolicyEntry`]
    pub fn build(self) -> Result<PolicyEntry> {
        let mut entry = self.entry;
        entry.pw_lockout_duration = dur_to_delta(self.lockout_duration)?;
        entry.pw_failcnt_interval = dur_to_delta(self.failcnt_interval)?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() -> Result<()> {
        let policy = PolicyEntry::builder("lockout")
            .max_fail(3)
            .lockout_duration(Some(Duration::from_secs(60)))
            .build()?;
        assert_eq!(policy.name, "lockout");
        assert_eq!(policy.pw_max_fail, 3);
        assert_eq!(policy.pw_lockout_duration, 60);
        assert_eq!(policy.failcnt_interval(), None);
        Ok(())
    }
}
