//! Database principal entries

use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::{
    conv::{delta_to_dur, ts_to_dt},
    error::Result,
    key_data::{KeyData, max_kvno, sort_key_data},
    name::PrincipalName,
    tl_data::TlData,
};

bitflags! {
    /// Attributes set on a principal
    ///
    /// See `man kadmin(1)`, under the `add_principal` section for an explanation
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct PrincipalAttributes: i32 {
        /// Prohibits the principal from obtaining postdated tickets
        const DisallowPostated = 0x0000_0001;
        /// Prohibits the principal from obtaining forwardable tickets
        const DisallowForwardable = 0x0000_0002;
        /// Specifies that a Ticket-Granting Service (TGS) request for a service ticket for the principal is not permitted
        const DisallowTgtBased = 0x0000_0004;
        /// Prohibits the principal from obtaining renewable tickets
        const DisallowRenewable = 0x0000_0008;
        /// Prohibits the principal from obtaining proxiable tickets
        const DisallowProxiable = 0x0000_0010;
        /// Disables user-to-user authentication for the principal
        const DisallowDupSkey = 0x0000_0020;
        /// Forbids the issuance of any tickets for the principal
        const DisallowAllTix = 0x0000_0040;
        /// Requires the principal to preauthenticate before being allowed to kinit
        const RequiresPreAuth = 0x0000_0080;
        /// Requires the principal to preauthenticate using a hardware device before being allowed to kinit
        const RequiresHwAuth = 0x0000_0100;
        /// Force a password change
        const RequiresPwChange = 0x0000_0200;
        /// Prohibits the issuance of service tickets for the principal
        const DisallowSvr = 0x0000_1000;
        /// Marks the principal as a password change service principal
        const PwChangeService = 0x0000_2000;
        /// Allow kadmin administrators with `add` acls to modify the principal until this bit is cleared
        const NewPrinc = 0x0000_8000;
        /// Sets the OK-AS-DELEGATE flag on tickets issued for use with the principal as the service
        const OkAsDelegate = 0x0010_0000;
        /// Sets the service to allow the use of S4U2Self
        const OkToAuthAsDelegate = 0x0020_0000;
        /// Prevents PAC or AD-SIGNEDPATH data from being added to service tickets for the principal
        const NoAuthDataRequired = 0x0040_0000;
        /// Prevents keys for the principal from being extracted or set to a known value by the kadmin protocol
        const LockdownKeys = 0x0080_0000;

        const _ = !0;
    }
}

/// A principal's database record
///
/// Timestamps and lifetimes are raw 32-bit database values, 0 meaning unset. The chrono-typed
/// accessors convert them.
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrincipalEntry {
    /// The principal name
    pub name: PrincipalName,
    /// See [`PrincipalAttributes`]
    pub attributes: PrincipalAttributes,
    /// Maximum ticket life, in seconds
    pub max_life: u32,
    /// Maximum renewable ticket life, in seconds
    pub max_renewable_life: u32,
    /// When the principal expires
    pub expiration: u32,
    /// When the password expires
    pub pw_expiration: u32,
    /// When the last successful authentication occurred. Not replicated
    pub last_success: u32,
    /// When the last failed authentication occurred. Not replicated
    pub last_failed: u32,
    /// Number of failed authentication attempts. Not replicated
    pub fail_auth_count: u32,
    /// Keys, sorted by descending kvno once read from a database
    pub key_data: Vec<KeyData>,
    /// TL-data
    pub tl_data: TlData,
    /// Backend-private extension bytes
    pub e_data: Vec<u8>,
}

impl PrincipalEntry {
    /// An empty entry for `name`
    pub fn new(name: PrincipalName) -> Self {
        Self {
            name,
            attributes: PrincipalAttributes::empty(),
            max_life: 0,
            max_renewable_life: 0,
            expiration: 0,
            pw_expiration: 0,
            last_success: 0,
            last_failed: 0,
            fail_auth_count: 0,
            key_data: Vec::new(),
            tl_data: TlData::default(),
            e_data: Vec::new(),
        }
    }

    /// When the principal expires
    pub fn expire_time(&self) -> Result<Option<DateTime<Utc>>> {
        ts_to_dt(self.expiration)
    }

    /// When the password expires
    pub fn password_expiration(&self) -> Result<Option<DateTime<Utc>>> {
        ts_to_dt(self.pw_expiration)
    }

    /// When the last successful authentication occurred
    pub fn last_success_time(&self) -> Result<Option<DateTime<Utc>>> {
        ts_to_dt(self.last_success)
    }

    /// When the last failed authentication occurred
    pub fn last_failed_time(&self) -> Result<Option<DateTime<Utc>>> {
        ts_to_dt(self.last_failed)
    }

    /// Maximum ticket life
    pub fn max_life_duration(&self) -> Option<std::time::Duration> {
        delta_to_dur(self.max_life)
    }

    /// Highest key version number, 0 without keys
    pub fn kvno(&self) -> u16 {
        max_kvno(&self.key_data)
    }

    /// Whether the lockout attributes differ from `other`'s
    pub(crate) fn lockout_differs(&self, other: &Self) -> bool {
        self.last_success != other.last_success
            || self.last_failed != other.last_failed
            || self.fail_auth_count != other.fail_auth_count
    }

    pub(crate) fn sort_key_data(&mut self) {
        sort_key_data(&mut self.key_data);
    }
}
