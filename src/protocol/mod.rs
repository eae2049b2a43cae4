//! Postgres frontend/backend protocol, version 3.0.
//!
//! Message layouts follow
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>.
pub mod frontend;
pub mod backend;

mod error;
mod database;

pub use backend::{BackendMessage, BackendProtocol};
pub use database::DatabaseError;
pub use error::ProtocolError;
pub use frontend::FrontendProtocol;

/// Server-assigned 32-bit type identifier.
pub type Oid = u32;

/// Built-in type oids from the `pg_type` catalog.
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const CHAR: Oid = 18;
    pub const NAME: Oid = 19;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const OID: Oid = 26;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const VARCHAR: Oid = 1043;
    pub const BPCHAR: Oid = 1042;
    pub const DATE: Oid = 1082;
    pub const TIME: Oid = 1083;
    pub const TIMESTAMP: Oid = 1114;
    pub const TIMESTAMPTZ: Oid = 1184;
    pub const INTERVAL: Oid = 1186;
    pub const TIMETZ: Oid = 1266;
    pub const NUMERIC: Oid = 1700;

    pub const BOOL_ARRAY: Oid = 1000;
    pub const INT2_ARRAY: Oid = 1005;
    pub const INT4_ARRAY: Oid = 1007;
    pub const INT8_ARRAY: Oid = 1016;
    pub const TEXT_ARRAY: Oid = 1009;
    pub const FLOAT4_ARRAY: Oid = 1021;
    pub const FLOAT8_ARRAY: Oid = 1022;
    pub const NUMERIC_ARRAY: Oid = 1231;

    /// Map an array oid to its element oid, where known.
    pub fn array_element(oid: Oid) -> Option<Oid> {
        Some(match oid {
            BOOL_ARRAY => BOOL,
            INT2_ARRAY => INT2,
            INT4_ARRAY => INT4,
            INT8_ARRAY => INT8,
            TEXT_ARRAY => TEXT,
            FLOAT4_ARRAY => FLOAT4,
            FLOAT8_ARRAY => FLOAT8,
            NUMERIC_ARRAY => NUMERIC,
            _ => return None,
        })
    }
}

/// Postgres data transmission format.
///
/// <https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgFormat {
    /// Text has format code zero.
    ///
    /// In the text transmitted representation, there is no trailing null character;
    /// the frontend must add one to received values if it wants to process them as C strings.
    Text,
    /// Binary has format code one.
    ///
    /// Binary representations for integers use network byte order (most significant byte first).
    Binary,
}

impl PgFormat {
    /// Return format code for current format.
    pub fn format_code(&self) -> u16 {
        match self {
            PgFormat::Text => 0,
            PgFormat::Binary => 1,
        }
    }

    pub fn from_code(code: i16) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(PgFormat::Text),
            1 => Ok(PgFormat::Binary),
            _ => Err(ProtocolError::unknown_format(code)),
        }
    }
}
