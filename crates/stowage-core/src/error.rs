//! Shared error taxonomy
//!
//! Every backend translates its native failures (errno values, HTTP statuses,
//! simulated faults) into exactly one [`StorageError`] before the error leaves
//! the adapter. Callers only ever branch on these variants.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using `StorageError`
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by every storage operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Object exists but the operation required it to be absent
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Credential rejected or filesystem permissions insufficient
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Precondition or version mismatch
    #[error("conflict: {0}")]
    Conflict(String),

    /// Key failed normalization
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Failure that may succeed if retried later
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        /// Minimum wait requested by the backend (e.g. `Retry-After`)
        retry_after: Option<Duration>,
    },

    /// Stored body does not match its recorded content hash
    #[error("corrupt object: {0}")]
    Corrupt(String),

    /// Backend down or retry budget exhausted
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Fieldless mirror of [`StorageError`] variants
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Conflict,
    InvalidKey,
    Transient,
    Corrupt,
    Unavailable,
}

impl ErrorKind {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::PermissionDenied => "PermissionDenied",
            Self::Conflict => "Conflict",
            Self::InvalidKey => "InvalidKey",
            Self::Transient => "Transient",
            Self::Corrupt => "Corrupt",
            Self::Unavailable => "Unavailable",
        }
    }

    /// Build an error of this kind carrying `message`
    pub fn into_error(self, message: impl Into<String>) -> StorageError {
        let message = message.into();
        match self {
            Self::NotFound => StorageError::NotFound(message),
            Self::AlreadyExists => StorageError::AlreadyExists(message),
            Self::PermissionDenied => StorageError::PermissionDenied(message),
            Self::Conflict => StorageError::Conflict(message),
            Self::InvalidKey => StorageError::InvalidKey(message),
            Self::Transient => StorageError::transient(message),
            Self::Corrupt => StorageError::Corrupt(message),
            Self::Unavailable => StorageError::Unavailable(message),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StorageError {
    /// Transient failure without a backend-supplied wait hint
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Transient failure that asks callers to wait at least `retry_after`
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after,
        }
    }

    /// The variant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidKey(_) => ErrorKind::InvalidKey,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Corrupt(_) => ErrorKind::Corrupt,
            Self::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Human-readable detail without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::AlreadyExists(m)
            | Self::PermissionDenied(m)
            | Self::Conflict(m)
            | Self::InvalidKey(m)
            | Self::Corrupt(m)
            | Self::Unavailable(m) => m,
            Self::Transient { message, .. } => message,
        }
    }

    /// Check if retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Backend-requested minimum wait before retrying
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
