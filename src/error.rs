//! [`Error`] type for various errors this library can encounter

/// Errors this library can encounter
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Represent a Kerberos error.
    ///
    /// Provided are the origin error code plus an error message as
    /// returned by `krb5_get_error_message`
    #[error("Kerberos error: {message} (code: {code})")]
    Kerberos {
        /// Kerberos error code
        code: i32,
        /// Kerberos error message
        message: String,
    },

    /// Principal or policy is not in the database
    #[error("Entry does not exist in the database")]
    NoEntry,
    /// Insertion was requested without overwriting and the entry already exists
    #[error("Entry already exists in the database")]
    DuplicateEntry,
    /// The target name of a rename is already taken
    #[error("Entry name is already in use")]
    InUse,

    /// No key data matched the requested search
    #[error("No matching key in entry")]
    NoMatchingKey,
    /// Matching keys exist but none of their encryption types are permitted
    #[error("Matching key found but its encryption type is not permitted")]
    NoPermittedKey,
    /// The requested master key could not be found
    #[error("Unable to find requested master key")]
    NoMasterKey,
    /// The provided master key does not decrypt the database master key entry
    #[error("Master key does not match database")]
    BadMasterKey,
    /// Integrity check failed while decrypting
    #[error("Decrypt integrity check failed")]
    Integrity,
    /// Key length doesn't match its encryption type
    #[error("Bad key size for encryption type")]
    BadKeySize,
    /// Encryption type unknown to the crypto provider
    #[error("Unsupported encryption type: {0}")]
    BadEncryptionType(i32),

    /// A declared length in a record exceeds the remaining buffer
    #[error("Truncated database record")]
    TruncatedRecord,
    /// Unsupported record or key data version
    #[error("Unsupported version: {0}")]
    BadVersion(u16),
    /// A field is too long for its length prefix
    #[error("Field too long for the record format")]
    FieldTooLong,
    /// Stored key length is larger than the decrypted plaintext
    #[error("Stored key is corrupted")]
    BadStoredKey,
    /// Conversion of a principal name failed
    #[error("Malformed principal name: {0}")]
    BadPrincipalName(String),

    /// The update log header is invalid
    #[error("Update log is corrupt")]
    UlogCorrupt,
    /// A single update does not fit in the maximum log size
    #[error("Update is too large for the update log")]
    UlogTooLarge,

    /// Memory allocation failed while building a record
    #[error("Memory allocation failed")]
    Allocation(#[from] std::collections::TryReserveError),

    /// The database lock could not be acquired
    #[error("Cannot lock database")]
    CantLockDatabase,
    /// Unlock was requested on a database that isn't locked
    #[error("Database not locked")]
    NotLocked,
    /// The on-disk file isn't in the expected engine format
    #[error("Unrecognized database file format")]
    FileFormat,

    /// The active backend doesn't implement the operation
    #[error("Operation not supported: {0}")]
    OperationNotSupported(&'static str),
    /// The client account is locked out
    #[error("Client's credentials have been revoked")]
    ClientRevoked,
    /// Invalid `key[=value]` database argument
    #[error("Invalid database argument: {0}")]
    BadDbArgs(String),
    /// No backend module by that name
    #[error("Unable to find requested database type: {0}")]
    UnknownModule(String),
    /// Operation attempted on a database handle that isn't open
    #[error("Database not initialized")]
    DatabaseNotOpen,
    /// Promotion was requested without a bulk load in progress
    #[error("No bulk load in progress")]
    NoLoadInProgress,

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// LMDB error
    #[error(transparent)]
    Lmdb(#[from] lmdb::Error),
    /// Couldn't convert bytes to a [`String`]
    #[error(transparent)]
    StringConversion(#[from] std::string::FromUtf8Error),

    /// Failed to convert a timestamp to a [`chrono::DateTime`]
    #[error("Failed to convert krb5 timestamp to chrono DateTime")]
    TimestampConversion,
    /// Failed to convert a [`chrono::DateTime`] to a timestamp
    #[error("Failed to convert chrono DateTime to krb5 timestamp")]
    DateTimeConversion(std::num::TryFromIntError),
    /// Failed to convert a [`Duration`][`std::time::Duration`] to a delta
    #[error("Failed to convert Duration to a krb5 deltat")]
    DurationConversion(std::num::TryFromIntError),

    /// Failed to acquire one of the process-wide locks
    #[error("Failed to acquire a process-wide lock")]
    LockError,

    /// Failed to load the krb5 library
    #[error("Failed to load the krb5 library")]
    LibraryLoadError(#[from] dlopen2::Error),
}

/// Helper type for errors sent from this library
pub type Result<T> = std::result::Result<T, Error>;

/// Helper function to "raise" an error from a `krb5_error_code`
///
/// `message` is only called for non-zero codes, to fetch the library's message for `code`.
pub(crate) fn krb5_error_code_escape_hatch<F>(code: i32, message: F) -> Result<()>
where
    F: FnOnce(i32) -> String,
{
    if code == 0 {
        Ok(())
    } else {
        Err(Error::Kerberos {
            code,
            message: message(code),
        })
    }
}
