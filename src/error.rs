//! Error taxonomy shared by every file system operation.

use std::io;

use thiserror::Error;

/// Result of file system operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable set of error kinds produced by the core and by back-ends.
///
/// Back-ends translate their own error domains into these kinds; the
/// cause strings are diagnostic only, the variant is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The file or directory does not exist.
    #[error("entry not found")]
    NotFound,
    /// The target of a creating operation already exists.
    #[error("entry already exists")]
    Exists,
    /// The back-end refused the operation for the calling identity.
    #[error("permission denied")]
    Permission,
    /// A directory was given to a non-directory operation.
    #[error("is a directory")]
    IsDir,
    /// A non-directory was given to a directory operation.
    #[error("not a directory")]
    NotDir,
    /// An attempt was made to remove a directory that was not empty.
    #[error("directory not empty")]
    NotEmpty,
    /// Malformed argument, out-of-range offset or unsupported flag
    /// combination.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// The handle failed internal consistency checks or is unknown.
    #[error("invalid handle")]
    InvalidHandle,
    /// The selected back-end does not support this operation.
    #[error("operation not supported")]
    NotSupported,
    /// The operation exists in the interface but has no implementation.
    #[error("operation not implemented")]
    NotImplemented,
    /// Hard error from the underlying storage, carrying its cause.
    #[error("i/o error: {0}")]
    Io(String),
    /// The caller abandoned the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// A read landed inside a chunk but outside every recorded slice.
    #[error("no data at offset")]
    NoData,
    /// Several independent failures, typically aggregated on close.
    #[error("multiple errors: {}", join_causes(.0))]
    Multi(Vec<Error>),
}

impl Error {
    /// Wrap an arbitrary cause as an [`Error::Io`].
    pub fn io(cause: impl ToString) -> Self {
        Error::Io(cause.to_string())
    }

    /// Classify a free-form message from a back-end that exposes no
    /// structured codes. Falls back to [`Error::Io`].
    pub fn classify_str(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("permission denied") {
            Error::Permission
        } else if lower.contains("not a directory") {
            Error::NotDir
        } else if lower.contains("no such file") {
            Error::NotFound
        } else {
            Error::Io(message.to_string())
        }
    }

    /// True for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            NotFound => Error::NotFound,
            PermissionDenied => Error::Permission,
            AlreadyExists => Error::Exists,
            InvalidInput | InvalidData => Error::Invalid(err.to_string()),
            NotADirectory => Error::NotDir,
            IsADirectory => Error::IsDir,
            DirectoryNotEmpty => Error::NotEmpty,
            Interrupted => Error::Cancelled,
            _ => Error::classify_str(&err.to_string()),
        }
    }
}

fn join_causes(errors: &[Error]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_by_kind() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err, Error::NotFound);

        let err: Error = io::Error::new(io::ErrorKind::AlreadyExists, "there").into();
        assert_eq!(err, Error::Exists);
    }

    #[test]
    fn opaque_messages_classify_by_substring() {
        assert_eq!(Error::classify_str("sftp: permission denied"), Error::Permission);
        assert_eq!(Error::classify_str("remote: Not a Directory"), Error::NotDir);
        assert_eq!(Error::classify_str("open: no such file or directory"), Error::NotFound);
        assert!(matches!(Error::classify_str("link budget exceeded"), Error::Io(_)));
    }

    #[test]
    fn multi_error_lists_every_cause() {
        let err = Error::Multi(vec![Error::NotFound, Error::Permission]);
        assert_eq!(err.to_string(), "multiple errors: entry not found; permission denied");
    }
}
