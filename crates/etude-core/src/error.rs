use crate::parser::ParseError;
use std::io;
use thiserror::Error;

/// Misuse of a [`Continuation`](crate::Continuation).
///
/// These are programming errors in the handler that triggered them. They
/// fail the current operation and are never silently ignored.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    /// `suspend` on a continuation that is already parked.
    #[error("continuation is already suspended")]
    AlreadySuspended,
    /// `resume` on a continuation that is not parked (never suspended,
    /// already resumed, or already timed out).
    #[error("continuation is not suspended")]
    NotSuspended,
    /// `suspend` called from a coroutine that does not own the continuation.
    #[error("continuation belongs to another coroutine")]
    NotOwner,
    /// The request the continuation was created for has completed.
    #[error("continuation's request has already finished")]
    Finished,
}

/// Central error type for the Etude runtime.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Error during HTTP request parsing.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    /// A continuation was used in a way its state does not allow.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),
    /// A suspended continuation was not resumed before its deadline.
    #[error("timed out")]
    Timeout,
    /// The peer went away while the handler was suspended.
    #[error("peer closed the connection while suspended")]
    ConnectionLost,
    /// The server stopped while the operation was pending.
    #[error("server is shutting down")]
    Shutdown,
    /// A cooperative operation was attempted outside of any coroutine.
    #[error("not running inside a coroutine")]
    NotInCoroutine,
    /// The application handler panicked.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EtudeError {
    /// True for the distinguished timeout outcome of `suspend`.
    pub fn is_timeout(&self) -> bool {
        match self {
            EtudeError::Timeout => true,
            EtudeError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, EtudeError::Usage(_))
    }
}

pub type EtudeResult<T> = Result<T, EtudeError>;
