//! Account lockout after repeated authentication failures
//!
//! A principal is locked once `fail_auth_count` reaches the `pw_max_fail` of its policy, for
//! `pw_lockout_duration` seconds after the last failure, or until an administrative unlock when
//! the duration is 0. Failures older than `pw_failcnt_interval` don't count.

use crate::{
    backend::KdbBackend,
    context::Context,
    conv::{ts_after, ts_incr},
    error::{Error, Result},
    principal::{PrincipalAttributes, PrincipalEntry},
};

/// Outcome of an initial ticket request
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[allow(clippy::exhaustive_enums)]
pub enum AuthStatus {
    /// The client authenticated
    Success,
    /// Preauthentication failed
    PreauthFailed,
    /// Integrity check of the client's request failed
    BadIntegrity,
    /// Any other failure, which doesn't count towards lockout
    Failed,
}

/// Lockout settings of a policy, all 0 without a policy
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct LockoutPolicy {
    /// Failures before lockout, 0 disables lockout
    pub max_fail: u32,
    /// Failure count reset interval, in seconds
    pub failcnt_interval: u32,
    /// Lockout duration, in seconds, 0 for a permanent lockout
    pub lockout_duration: u32,
}

/// Lockout settings of the policy referenced by `entry`
///
/// A reference to a policy that doesn't exist is treated as no policy.
pub fn lookup_lockout_policy(
    backend: &dyn KdbBackend,
    entry: &PrincipalEntry,
) -> Result<LockoutPolicy> {
    let Some(name) = entry.tl_data.policy()? else {
        return Ok(LockoutPolicy::default());
    };
    match backend.get_policy(&name) {
        Ok(policy) => Ok(LockoutPolicy {
            max_fail: policy.pw_max_fail,
            failcnt_interval: policy.pw_failcnt_interval,
            lockout_duration: policy.pw_lockout_duration,
        }),
        Err(Error::NoEntry) => {
            log::debug!("{} references missing policy {name}", entry.name);
            Ok(LockoutPolicy::default())
        }
        Err(err) => Err(err),
    }
}

/// Whether an administrator unlocked `entry` after its last failure
fn unlocked_since_last_failure(entry: &PrincipalEntry) -> Result<bool> {
    let unlock_time = entry.tl_data.last_admin_unlock()?;
    Ok(!ts_after(entry.last_failed, unlock_time))
}

/// Whether `entry` is locked at `now`
pub fn is_locked(entry: &PrincipalEntry, policy: &LockoutPolicy, now: u32) -> Result<bool> {
    if unlocked_since_last_failure(entry)? {
        return Ok(false);
    }
    if policy.max_fail == 0 || entry.fail_auth_count < policy.max_fail {
        return Ok(false);
    }
    if policy.lockout_duration == 0 {
        return Ok(true);
    }
    Ok(ts_after(
        ts_incr(entry.last_failed, policy.lockout_duration),
        now,
    ))
}

/// Refuse initial tickets to locked principals with [`Error::ClientRevoked`]
pub fn check_policy_as(
    ctx: &Context,
    backend: &dyn KdbBackend,
    entry: &PrincipalEntry,
    now: u32,
) -> Result<()> {
    if ctx.params().disable_lockout() {
        return Ok(());
    }
    let policy = lookup_lockout_policy(backend, entry)?;
    if is_locked(entry, &policy, now)? {
        log::info!(
            "{} is locked out after {} failures (last at {})",
            entry.name,
            entry.fail_auth_count,
            entry.last_failed
        );
        return Err(Error::ClientRevoked);
    }
    Ok(())
}

/// Update the lockout attributes of `entry` after an authentication attempt
///
/// The update is written through [`KdbBackend::update_lockout`], bypassing the update log.
pub fn audit_as_req(
    ctx: &Context,
    backend: &dyn KdbBackend,
    entry: &PrincipalEntry,
    now: u32,
    status: AuthStatus,
) -> Result<()> {
    let params = ctx.params();
    if params.disable_lockout() && params.disable_last_success() {
        return Ok(());
    }
    let policy = if params.disable_lockout() {
        LockoutPolicy::default()
    } else {
        lookup_lockout_policy(backend, entry)?
    };
    // Already locked accounts are left alone
    if is_locked(entry, &policy, now)? {
        return Ok(());
    }

    let mut updated = entry.clone();
    let mut need_update = false;
    match status {
        AuthStatus::Success if entry.attributes.contains(PrincipalAttributes::RequiresPreAuth) => {
            if !params.disable_lockout() && updated.fail_auth_count != 0 {
                updated.fail_auth_count = 0;
                need_update = true;
            }
            if !params.disable_last_success() {
                updated.last_success = now;
                need_update = true;
            }
        }
        AuthStatus::PreauthFailed | AuthStatus::BadIntegrity if !params.disable_lockout() => {
            if unlocked_since_last_failure(&updated)? {
                updated.fail_auth_count = 0;
            }
            if policy.failcnt_interval != 0
                && ts_after(now, ts_incr(updated.last_failed, policy.failcnt_interval))
            {
                updated.fail_auth_count = 0;
            }
            updated.last_failed = now;
            updated.fail_auth_count = updated.fail_auth_count.saturating_add(1);
            need_update = true;
            if policy.max_fail != 0 && updated.fail_auth_count == policy.max_fail {
                log::info!("{} reached {} failures, locking", entry.name, policy.max_fail);
            }
        }
        _ => {}
    }

    if need_update {
        backend.update_lockout(&updated)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::PrincipalName;

    fn entry(count: u32, last_failed: u32) -> PrincipalEntry {
        let mut entry =
            PrincipalEntry::new(PrincipalName::parse("alice", Some("EXAMPLE.COM")).unwrap());
        entry.fail_auth_count = count;
        entry.last_failed = last_failed;
        entry
    }

    const POLICY: LockoutPolicy = LockoutPolicy {
        max_fail: 3,
        failcnt_interval: 0,
        lockout_duration: 60,
    };

    #[test]
    fn locked_until_duration_elapses() -> Result<()> {
        let locked = entry(3, 1000);
        assert!(is_locked(&locked, &POLICY, 1000)?);
        assert!(is_locked(&locked, &POLICY, 1059)?);
        assert!(!is_locked(&locked, &POLICY, 1060)?);
        assert!(!is_locked(&entry(2, 1000), &POLICY, 1000)?);
        Ok(())
    }

    #[test]
    fn permanent_and_disabled() -> Result<()> {
        let locked = entry(5, 1000);
        let permanent = LockoutPolicy {
            lockout_duration: 0,
            ..POLICY
        };
        assert!(is_locked(&locked, &permanent, u32::MAX)?);
        assert!(!is_locked(&locked, &LockoutPolicy::default(), 1000)?);
        Ok(())
    }

    #[test]
    fn admin_unlock() -> Result<()> {
        let mut locked = entry(3, 1000);
        locked.tl_data.set_last_admin_unlock(1000);
        assert!(!is_locked(&locked, &POLICY, 1001)?);
        locked.tl_data.set_last_admin_unlock(999);
        assert!(is_locked(&locked, &POLICY, 1001)?);
        Ok(())
    }
}
