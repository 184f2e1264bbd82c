//! Error types for htdb core.

use htdb_storage::StorageError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse classification of every [`CoreError`].
///
/// This is the taxonomy reported to log sinks and kept by the handle as
/// its last error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The filesystem failed an operation.
    Io,
    /// The file content is structurally invalid.
    Corrupt,
    /// A write was attempted through a read-only handle.
    ReadOnly,
    /// A lock could not be taken.
    Lock,
    /// The key is not present.
    NoSuchKey,
    /// The key is already present and insert-only semantics were requested.
    AlreadyExists,
    /// The configured hash function does not match the file.
    WrongHashFunction,
    /// The file could not grow.
    OutOfSpace,
    /// The call was malformed or made in the wrong state.
    InvalidArgument,
}

impl ErrorKind {
    /// Returns a short, stable name for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Io => "IO",
            Self::Corrupt => "CORRUPT",
            Self::ReadOnly => "READ_ONLY",
            Self::Lock => "LOCK",
            Self::NoSuchKey => "NO_SUCH_KEY",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::WrongHashFunction => "WRONG_HASH_FUNCTION",
            Self::OutOfSpace => "OUT_OF_SPACE",
            Self::InvalidArgument => "INVALID_ARGUMENT",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in htdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file content is structurally invalid.
    #[error("corrupt database: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },

    /// The file is not an htdb database at all.
    #[error("not a database: {message}")]
    NotADatabase {
        /// What was found instead.
        message: String,
    },

    /// The handle or the operation is read-only.
    #[error("database is read-only")]
    ReadOnly,

    /// A lock could not be taken or released.
    #[error("lock error: {message}")]
    Lock {
        /// Description of the failure.
        message: String,
    },

    /// A non-blocking lock attempt met contention.
    #[error("operation would block")]
    WouldBlock,

    /// The file is already open through another handle in this process.
    #[error("database is already open in this process")]
    AlreadyOpen,

    /// The key is not present.
    #[error("no such key")]
    NoSuchKey,

    /// The key is already present.
    #[error("key already exists")]
    AlreadyExists,

    /// The configured hash function does not match the file.
    #[error("wrong hash function: {message}")]
    WrongHashFunction {
        /// Description of the mismatch.
        message: String,
    },

    /// A size computation exceeded what the file format can address.
    #[error("out of space: {message}")]
    OutOfSpace {
        /// Description of the failure.
        message: String,
    },

    /// The call was malformed or made in the wrong state.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of why the call is invalid.
        message: String,
    },

    /// The transaction could not commit and was cancelled.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// The handle refuses work after an unrecoverable failure.
    #[error("database handle disabled after a fatal {kind} error")]
    Disabled {
        /// Kind of the failure that disabled the handle.
        kind: ErrorKind,
    },
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Creates a not-a-database error.
    pub fn not_a_database(message: impl Into<String>) -> Self {
        Self::NotADatabase {
            message: message.into(),
        }
    }

    /// Creates a lock error.
    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock {
            message: message.into(),
        }
    }

    /// Creates a wrong hash function error.
    pub fn wrong_hash(message: impl Into<String>) -> Self {
        Self::WrongHashFunction {
            message: message.into(),
        }
    }

    /// Creates an out of space error.
    pub fn out_of_space(message: impl Into<String>) -> Self {
        Self::OutOfSpace {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(err) => match err {
                StorageError::Io(_) => ErrorKind::Io,
                StorageError::ReadPastEnd { .. } | StorageError::WritePastEnd { .. } => {
                    ErrorKind::Corrupt
                }
                StorageError::OutOfSpace { .. } => ErrorKind::OutOfSpace,
                StorageError::ReadOnly => ErrorKind::ReadOnly,
            },
            Self::Io(_) | Self::TransactionAborted { .. } => ErrorKind::Io,
            Self::Corrupt { .. } | Self::NotADatabase { .. } => ErrorKind::Corrupt,
            Self::ReadOnly => ErrorKind::ReadOnly,
            Self::Lock { .. } | Self::WouldBlock | Self::AlreadyOpen => ErrorKind::Lock,
            Self::NoSuchKey => ErrorKind::NoSuchKey,
            Self::AlreadyExists => ErrorKind::AlreadyExists,
            Self::WrongHashFunction { .. } => ErrorKind::WrongHashFunction,
            Self::OutOfSpace { .. } => ErrorKind::OutOfSpace,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Disabled { kind } => *kind,
        }
    }

    /// Returns true for a failed non-blocking lock attempt.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// Turns an out-of-range access into a corruption report.
    ///
    /// Offsets read from the file that point past its end mean the file is
    /// damaged, not that the filesystem failed.
    pub(crate) fn into_corrupt(self) -> Self {
        match self {
            Self::Storage(
                err @ (StorageError::ReadPastEnd { .. } | StorageError::WritePastEnd { .. }),
            ) => Self::corrupt(err.to_string()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(CoreError::corrupt("x").kind(), ErrorKind::Corrupt);
        assert_eq!(CoreError::not_a_database("x").kind(), ErrorKind::Corrupt);
        assert_eq!(CoreError::WouldBlock.kind(), ErrorKind::Lock);
        assert_eq!(CoreError::wrong_hash("x").kind(), ErrorKind::WrongHashFunction);
        assert_eq!(
            CoreError::Disabled {
                kind: ErrorKind::Io
            }
            .kind(),
            ErrorKind::Io
        );
        let past_end = CoreError::from(StorageError::ReadPastEnd {
            offset: 10,
            len: 1,
            size: 4,
        });
        assert_eq!(past_end.kind(), ErrorKind::Corrupt);
        let full = CoreError::from(StorageError::OutOfSpace { requested: 1 });
        assert_eq!(full.kind(), ErrorKind::OutOfSpace);
    }

    #[test]
    fn out_of_range_becomes_corrupt() {
        let err = CoreError::from(StorageError::ReadPastEnd {
            offset: 10,
            len: 1,
            size: 4,
        })
        .into_corrupt();
        assert!(matches!(err, CoreError::Corrupt { .. }));

        let err = CoreError::NoSuchKey.into_corrupt();
        assert!(matches!(err, CoreError::NoSuchKey));
    }

    #[test]
    fn kind_names() {
        assert_eq!(ErrorKind::NoSuchKey.to_string(), "NO_SUCH_KEY");
        assert_eq!(ErrorKind::WrongHashFunction.as_str(), "WRONG_HASH_FUNCTION");
    }
}
