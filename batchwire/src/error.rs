//! `batchwire` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    batch::UsageError,
    outcome::BatchFailure,
    protocol::{ProtocolError, ServerError},
    row::DecodeError,
};

/// A specialized [`Result`] type for `batchwire` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `batchwire` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// All possible error kind from `batchwire` library.
pub enum ErrorKind {
    /// Malformed or out-of-sequence frame, the connection is unusable.
    Protocol(ProtocolError),
    /// The transport failed, the batch is aborted and never retried here.
    Io(io::Error),
    /// The server rejected a statement and the batch runs fail-fast.
    ///
    /// Outcomes completed before the failure ride along.
    Batch(BatchFailure),
    /// Caller misuse detected before any I/O.
    Usage(UsageError),
    /// Returned row value could not be decoded.
    Decode(DecodeError),
}

impl Error {
    /// The server error that aborted a fail-fast batch, if that is what this
    /// error is.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match &self.kind {
            ErrorKind::Batch(failure) => Some(&failure.error),
            _ => None,
        }
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<BatchFailure>e => ErrorKind::Batch(e));
from!(<UsageError>e => ErrorKind::Usage(e));
from!(<DecodeError>e => ErrorKind::Decode(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Batch(e) => e.fmt(f),
            Self::Usage(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
