//! `pgcore` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    connection::{AuthError, ParseError},
    phase::StateError,
    protocol::{DatabaseError, ProtocolError},
    row::DecodeError,
    types::CodecError,
};

/// A specialized [`Result`] type for `pgcore` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from the `pgcore` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// The decoded server error, when this is a statement-level database error.
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match &self.kind {
            ErrorKind::Database(err) => Some(err),
            _ => None,
        }
    }

    /// SQLSTATE classification of this error, where one applies.
    ///
    /// Transport faults map to 08006 (connection failure), calls on a closed
    /// connection to 08003, and wrong-phase calls to 55000 (object not in
    /// prerequisite state); server errors carry their own code.
    pub fn sqlstate(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::Database(err) => Some(err.code()),
            ErrorKind::Io(_) => Some("08006"),
            ErrorKind::State(err) if matches!(err.phase, crate::phase::Phase::Closed) => {
                Some("08003")
            }
            ErrorKind::State(_) => Some("55000"),
            _ => None,
        }
    }

    /// Whether this error poisons the connection.
    ///
    /// Transport and protocol errors are fatal; everything else is surfaced
    /// to the caller and the connection drains to the next `ReadyForQuery`.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Io(_) | ErrorKind::Protocol(_))
    }

    pub(crate) fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// All possible error kind from the `pgcore` library.
pub enum ErrorKind {
    /// An I/O fault on the transport; the connection is permanently poisoned.
    Io(io::Error),
    /// The server sent an illegal sequence or malformed message; fatal.
    Protocol(ProtocolError),
    /// A decoded server `ErrorResponse`; recoverable at the statement level.
    Database(DatabaseError),
    /// A registered value codec refused bytes; the row fails, the connection
    /// is undamaged.
    Codec(CodecError),
    /// An API call was issued in the wrong connection phase.
    State(StateError),
    /// Startup reported a `client_encoding` other than UTF8.
    UnsupportedEncoding(String),
    /// Unsupported or failed authentication mechanism.
    Auth(AuthError),
    /// Connection url/configuration parsing failed.
    Config(ParseError),
    /// Row or column access failed (missing column, oid mismatch).
    Decode(DecodeError),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<DatabaseError>e => ErrorKind::Database(e));
from!(<CodecError>e => ErrorKind::Codec(e));
from!(<StateError>e => ErrorKind::State(e));
from!(<AuthError>e => ErrorKind::Auth(e));
from!(<ParseError>e => ErrorKind::Config(e));
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
            Self::Io(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Codec(e) => e.fmt(f),
            Self::State(e) => e.fmt(f),
            Self::UnsupportedEncoding(enc) => {
                write!(f, "unsupported client_encoding {enc:?}, only UTF8 is supported")
            }
            Self::Auth(e) => e.fmt(f),
            Self::Config(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
