use thiserror::Error;

use crate::backend::FileKind;

pub type Result<T> = std::result::Result<T, SiloError>;

#[derive(Debug, Error)]
pub enum SiloError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{kind} file '{name}' not found")]
    NotFound { kind: FileKind, name: String },

    #[error("permanent error: {0}")]
    Permanent(#[source] Box<SiloError>),

    #[error("ciphertext verification failed")]
    DecryptionFailed,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("wrong password or no key found")]
    NoKeyFound,

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("no matching id found for prefix '{0}'")]
    NoIdPrefixFound(String),

    #[error("multiple ids match prefix '{0}'")]
    MultipleIdMatches(String),

    #[error("invalid pack header: {0}")]
    InvalidHeader(String),

    #[error("pack too small to hold a header")]
    HeaderTooShort,

    #[error("pack header exceeds maximum size ({0} bytes)")]
    HeaderTooLong(u32),

    #[error("pack is truncated: declared blob lengths exceed file size")]
    Truncated,

    #[error("blob {0} not found in index")]
    BlobNotFound(crate::id::Id),

    #[error("blob {id} failed verification: {reason}")]
    BlobCorrupt { id: crate::id::Id, reason: String },

    #[error("malformed {0} JSON: {1}")]
    Decode(&'static str, #[source] serde_json::Error),

    #[error("repository is already locked by {0}")]
    AlreadyLocked(String),

    #[error("invalid repository config: {0}")]
    Config(String),

    #[error("repository already initialized")]
    AlreadyInitialized,

    #[error("unsupported repository version: {0}")]
    UnsupportedVersion(u32),

    #[error("invalid node '{name}': {reason}")]
    InvalidNode { name: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl SiloError {
    /// Whether this error means the requested file does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            SiloError::NotFound { .. } => true,
            SiloError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            SiloError::Permanent(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// Whether retrying the operation cannot help.
    ///
    /// The retry wrapper gives up immediately on permanent errors instead of
    /// burning through its backoff budget.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SiloError::Permanent(_) | SiloError::NotFound { .. } | SiloError::Cancelled
        )
    }

    /// Whether the error is a transient transport failure worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            SiloError::Io(e) => is_retryable_io(e),
            SiloError::Other(_) => true,
            _ => false,
        }
    }

    /// Wrap an I/O error, promoting exhausted-disk conditions to permanent so
    /// callers can pattern-match the original errno.
    pub fn from_io_save(e: std::io::Error) -> Self {
        if e.raw_os_error() == Some(libc::ENOSPC) {
            return SiloError::Permanent(Box::new(SiloError::Io(e)));
        }
        SiloError::Io(e)
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}
