//! Crate-wide error type.

use std::fmt;

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the storage engine, locking model, and networking
/// stack.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A name, JSON document, or wire value failed to parse or validate.
    #[error("parse error: {0}")]
    Parse(String),

    /// The referenced VM, path, or cache entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The destination of a publish/rename already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A `flock`/`fcntl` lock is held by another process.
    #[error("{0}")]
    AlreadyLocked(AlreadyLockedKind),

    /// A registry HTTP call failed or returned an unusable manifest.
    #[error("registry error: {message}")]
    Oci {
        /// HTTP status code, when the failure came from a response.
        status: Option<u16>,
        /// Human-readable detail.
        message: String,
    },

    /// A compressed stream was truncated or malformed.
    #[error("decompression error: {0}")]
    Decompression(String),

    /// The current OS/build does not support this operation.
    #[error("not supported on this platform: {0}")]
    Platform(String),

    /// The operation observed cooperative cancellation.
    #[error("canceled")]
    Canceled,

    /// Propagated I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Propagated JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Distinguishes the two advisory-lock flavors so the message matches what
/// users expect from each ("already running" vs. "already locked").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlreadyLockedKind {
    /// A `PIDLock` on `config.json` is held by a running hypervisor.
    Running,
    /// A `FileLock` on a VM directory is held by another process.
    Directory,
}

impl fmt::Display for AlreadyLockedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "VM is already running"),
            Self::Directory => write!(f, "VM directory is already locked"),
        }
    }
}

impl Error {
    /// Shorthand for [`Error::AlreadyLocked`] with [`AlreadyLockedKind::Running`].
    #[must_use]
    pub fn already_running() -> Self {
        Self::AlreadyLocked(AlreadyLockedKind::Running)
    }

    /// Shorthand for [`Error::AlreadyLocked`] with [`AlreadyLockedKind::Directory`].
    #[must_use]
    pub fn already_locked() -> Self {
        Self::AlreadyLocked(AlreadyLockedKind::Directory)
    }
}
