use thiserror::Error;

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad input, record not found (4xx equivalent)
/// - `Retryable`   — write conflict; the enclosing unit of work SHOULD be
///   retried from scratch by the caller's retry layer
/// - `Transient`   — interruption, shutdown; client MAY retry after back-off
/// - `InternalBug` — should never happen; triggers alert + diagnostic dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type shared across the workspace.
#[derive(Error, Debug)]
pub enum Error {
    /// Another transaction committed a write to the same key after our
    /// snapshot was taken. Never retried inside the store; the operation
    /// retry framework restarts the whole unit of work.
    #[error("write conflict")]
    WriteConflict,

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("record not found")]
    NotFound,

    #[error("operation interrupted")]
    Interrupted,

    /// Internal invariant breach — should never occur in production.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WriteConflict => ErrorKind::Retryable,
            Error::BadValue(_) | Error::NotFound => ErrorKind::UserError,
            Error::Interrupted => ErrorKind::Transient,
            Error::Internal(_) => ErrorKind::InternalBug,
        }
    }

    /// True when the caller should retry the whole unit of work.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Error::WriteConflict)
    }
}
