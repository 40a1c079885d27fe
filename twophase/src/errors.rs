use backtrace::Backtrace;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::result::Result;

/// Error kinds for prepared-transaction operations.
///
/// Each kind describes one category of failure so that callers can decide whether
/// the failure is a user error (reject the statement, nothing changed) or a
/// condition that must stop recovery.
///
/// # Examples
///
/// ```rust
/// use twophase::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
///
/// fn example() -> TwoPhaseResult<()> {
///     Err(TwoPhaseError::new("transaction identifier \"tx1\" is already in use", ErrorKind::DuplicateGlobalId))
/// }
///
/// assert_eq!(example().unwrap_err().kind(), &ErrorKind::DuplicateGlobalId);
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    // User errors raised by prepare/finish, no state change
    /// The global identifier is already used by a live prepared transaction
    DuplicateGlobalId,
    /// All slots of the global transaction table are in use
    TableFull,
    /// The table capacity is zero, prepared transactions are disabled
    FeatureDisabled,
    /// No prepared transaction matches the requested identifier
    NotFound,
    /// Another backend is currently preparing or finishing the transaction
    Busy,
    /// The session is not allowed to finish the transaction
    PermissionDenied,
    /// The global identifier is empty or too long
    InvalidGid,
    /// The operation is not valid in the current state
    InvalidOperation,

    // Collaborator errors
    /// A lock could not be granted because of a conflicting holder
    LockConflict,
    /// A resource manager is unknown or its callback failed
    ResourceManagerError,

    // Recovery errors, fatal to startup
    /// A durable-state file or PREPARE record is unreadable or inconsistent
    CorruptDurableState,
    /// A malformed WAL record was found before the tail of the log
    TruncatedWalRecord,

    // WAL and IO errors
    /// The requested WAL position has already been discarded
    WalSegmentRemoved,
    /// Generic WAL append/flush/read failure
    WalError,
    /// Generic IO error
    IOError,
    /// Error encoding or decoding a record
    EncodingError,

    /// Internal error (usually indicates a bug)
    InternalError,
}

impl ErrorKind {
    /// Returns `true` for kinds that must halt recovery instead of being skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::CorruptDurableState | ErrorKind::TruncatedWalRecord
        )
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::DuplicateGlobalId => write!(f, "Duplicate global id"),
            ErrorKind::TableFull => write!(f, "Table full"),
            ErrorKind::FeatureDisabled => write!(f, "Feature disabled"),
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::Busy => write!(f, "Busy"),
            ErrorKind::PermissionDenied => write!(f, "Permission denied"),
            ErrorKind::InvalidGid => write!(f, "Invalid gid"),
            ErrorKind::InvalidOperation => write!(f, "Invalid operation"),
            ErrorKind::LockConflict => write!(f, "Lock conflict"),
            ErrorKind::ResourceManagerError => write!(f, "Resource manager error"),
            ErrorKind::CorruptDurableState => write!(f, "Corrupt durable state"),
            ErrorKind::TruncatedWalRecord => write!(f, "Truncated WAL record"),
            ErrorKind::WalSegmentRemoved => write!(f, "WAL segment removed"),
            ErrorKind::WalError => write!(f, "WAL error"),
            ErrorKind::IOError => write!(f, "IO error"),
            ErrorKind::EncodingError => write!(f, "Encoding error"),
            ErrorKind::InternalError => write!(f, "Internal error"),
        }
    }
}

/// Error type for prepared-transaction operations.
///
/// `TwoPhaseError` carries a message, a kind, an optional cause and the
/// backtrace captured where it was created.
///
/// # Examples
///
/// ```rust
/// use twophase::errors::{ErrorKind, TwoPhaseError};
///
/// let cause = TwoPhaseError::new("disk unplugged", ErrorKind::IOError);
/// let err = TwoPhaseError::new_with_cause("could not flush WAL", ErrorKind::WalError, cause);
/// assert!(err.cause().is_some());
/// ```
#[derive(Clone)]
pub struct TwoPhaseError {
    message: String,
    error_kind: ErrorKind,
    cause: Option<Box<TwoPhaseError>>,
    backtrace: Backtrace,
}

impl TwoPhaseError {
    /// Creates a new `TwoPhaseError` with the specified message and error kind.
    ///
    /// # Arguments
    ///
    /// * `message` - A description of the error
    /// * `error_kind` - The category of error
    pub fn new(message: &str, error_kind: ErrorKind) -> Self {
        TwoPhaseError {
            message: message.to_string(),
            error_kind,
            cause: None,
            backtrace: Backtrace::new_unresolved(),
        }
    }

    /// Creates a new `TwoPhaseError` wrapping the error that caused it.
    ///
    /// # Arguments
    ///
    /// * `message` - A description of the error
    /// * `error_kind` - The category of error
    /// * `cause` - The underlying error
    pub fn new_with_cause(message: &str, error_kind: ErrorKind, cause: TwoPhaseError) -> Self {
        TwoPhaseError {
            message: message.to_string(),
            error_kind,
            cause: Some(Box::new(cause)),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn cause(&self) -> Option<&TwoPhaseError> {
        self.cause.as_deref()
    }

    /// Returns `true` when this error must stop recovery.
    pub fn is_fatal(&self) -> bool {
        self.error_kind.is_fatal()
    }
}

impl Display for TwoPhaseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Debug for TwoPhaseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // print error message with stack trace followed by cause
        match &self.cause {
            Some(cause) => write!(f, "{} ({})\nCaused by: {:?}", self.message, self.error_kind, cause),
            None => {
                let mut backtrace = self.backtrace.clone();
                backtrace.resolve();
                write!(f, "{} ({})\n{:?}", self.message, self.error_kind, backtrace)
            }
        }
    }
}

impl Error for TwoPhaseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

/// A result type alias for prepared-transaction operations.
pub type TwoPhaseResult<T> = Result<T, TwoPhaseError>;

impl From<std::io::Error> for TwoPhaseError {
    fn from(err: std::io::Error) -> Self {
        TwoPhaseError::new(&format!("IO error: {}", err), ErrorKind::IOError)
    }
}

impl From<bincode::error::EncodeError> for TwoPhaseError {
    fn from(err: bincode::error::EncodeError) -> Self {
        TwoPhaseError::new(
            &format!("could not encode record: {}", err),
            ErrorKind::EncodingError,
        )
    }
}

impl From<bincode::error::DecodeError> for TwoPhaseError {
    fn from(err: bincode::error::DecodeError) -> Self {
        TwoPhaseError::new(
            &format!("could not decode record: {}", err),
            ErrorKind::EncodingError,
        )
    }
}
