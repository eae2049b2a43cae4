//! Protocol-level decode errors.
use std::fmt;
use std::str::Utf8Error;

/// An error when translating buffer from postgres.
///
/// A protocol error is fatal for the connection: the stream position can no
/// longer be trusted, so the connection transitions to `Closed`.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{0}")]
    Unexpected(Unexpected),

    #[error("unknown authentication request {auth}")]
    UnknownAuth { auth: i32 },

    #[error("message length {len} outside allowed range (max {max})")]
    MessageSize { len: i64, max: usize },

    #[error("malformed message: {reason}")]
    Malformed { reason: &'static str },

    #[error("postgres sent a non utf8 string: {0}")]
    NonUtf8(#[from] Utf8Error),

    #[error("unknown format code {0}")]
    UnknownFormat(i16),

    #[error("unknown transaction status {0:?}")]
    UnknownTransactionStatus(char),
}

/// An unexpected message type, possibly bound to a protocol phase.
#[derive(Debug)]
pub struct Unexpected {
    pub expect: Option<char>,
    pub found: char,
    pub phase: Option<&'static str>,
}

impl fmt::Display for Unexpected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected message {:?}", self.found)?;
        if let Some(expect) = self.expect {
            write!(f, ", expected {expect:?}")?;
        }
        if let Some(phase) = self.phase {
            write!(f, " during {phase}")?;
        }
        Ok(())
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected(Unexpected { expect: None, found: found as char, phase: None })
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected(Unexpected {
            expect: Some(expect as char),
            found: found as char,
            phase: None,
        })
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected(Unexpected { expect: None, found: found as char, phase: Some(phase) })
    }

    pub(crate) fn unknown_auth(auth: i32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn message_size(len: i64, max: usize) -> ProtocolError {
        Self::MessageSize { len, max }
    }

    pub(crate) fn malformed(reason: &'static str) -> ProtocolError {
        Self::Malformed { reason }
    }

    pub(crate) fn missing_nul() -> ProtocolError {
        Self::Malformed { reason: "string is not nul terminated" }
    }

    pub(crate) fn non_utf8(err: Utf8Error) -> ProtocolError {
        Self::NonUtf8(err)
    }

    pub(crate) fn unknown_format(code: i16) -> ProtocolError {
        Self::UnknownFormat(code)
    }
}
