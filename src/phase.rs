//! Connection lifecycle state machine.
//!
//! The connection phase is a single tagged value; every operation entry point
//! dispatches on it through [`Phase::expect`], so an out-of-phase call is
//! denied in exactly one place.
use std::fmt;

use crate::protocol::ProtocolError;

/// Backend transaction status, as reported by the last `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`: idle, not in a transaction block.
    Idle,
    /// `T`: in a transaction block.
    InBlock,
    /// `E`: in a failed transaction block; queries will be rejected until
    /// the block is ended.
    InFailedBlock,
}

impl TransactionStatus {
    pub(crate) fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            b'I' => Ok(Self::Idle),
            b'T' => Ok(Self::InBlock),
            b'E' => Ok(Self::InFailedBlock),
            other => Err(ProtocolError::UnknownTransactionStatus(other as char)),
        }
    }
}

/// Connection lifecycle phase.
///
/// ```text
/// Startup -> Authenticating -> ReadyIdle <-> SimpleQuery
///                                        <-> ExtendedQuery
///                                        <-> CopyIn / CopyOut
///                                        --> Closed
/// ```
///
/// `ReadyForQuery` always returns the connection to `ReadyIdle`. Transport
/// and protocol faults move it to `Closed` permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Startup message sent, waiting for the authentication exchange.
    Startup,
    /// Authentication request received, exchange in progress.
    Authenticating,
    /// Synchronized; a new query cycle may begin.
    ReadyIdle,
    /// A simple `Query` cycle is in flight.
    SimpleQuery,
    /// An extended Parse/Bind/Execute/Sync cycle is in flight.
    ExtendedQuery,
    /// Server accepted `COPY ... FROM STDIN`; only CopyData/CopyDone/CopyFail
    /// may be sent.
    CopyIn,
    /// Server is streaming `COPY ... TO STDOUT` data.
    CopyOut,
    /// An error interrupted an extended cycle; the connection drains to the
    /// next `ReadyForQuery` before accepting work.
    PendingSync,
    /// Terminated, or poisoned by a transport/protocol fault.
    Closed,
}

impl Phase {
    /// Deny an operation unless the connection is in `expected` phase.
    pub(crate) fn expect(self, expected: Phase, operation: &'static str) -> Result<(), StateError> {
        if self == expected {
            Ok(())
        } else {
            Err(StateError { operation, phase: self })
        }
    }

}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Startup => "startup",
            Phase::Authenticating => "authenticating",
            Phase::ReadyIdle => "idle",
            Phase::SimpleQuery => "simple query",
            Phase::ExtendedQuery => "extended query",
            Phase::CopyIn => "copy-in",
            Phase::CopyOut => "copy-out",
            Phase::PendingSync => "pending sync",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// An API call was issued in the wrong connection phase.
///
/// Maps to SQLSTATE 55000 (object not in prerequisite state).
#[derive(Debug, thiserror::Error)]
#[error("cannot {operation} while connection is {phase}")]
pub struct StateError {
    pub operation: &'static str,
    pub phase: Phase,
}

impl StateError {
    pub(crate) fn new(operation: &'static str, phase: Phase) -> Self {
        Self { operation, phase }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expect_denies_wrong_phase() {
        assert!(Phase::ReadyIdle.expect(Phase::ReadyIdle, "query").is_ok());
        let err = Phase::CopyIn.expect(Phase::ReadyIdle, "query").unwrap_err();
        assert!(err.to_string().contains("copy-in"));
    }

    #[test]
    fn transaction_status_bytes() {
        assert_eq!(TransactionStatus::from_byte(b'I').unwrap(), TransactionStatus::Idle);
        assert_eq!(TransactionStatus::from_byte(b'T').unwrap(), TransactionStatus::InBlock);
        assert_eq!(
            TransactionStatus::from_byte(b'E').unwrap(),
            TransactionStatus::InFailedBlock
        );
        assert!(TransactionStatus::from_byte(b'?').is_err());
    }
}
