//! Postgres Backend Messages
use bytes::{Buf, Bytes};

use super::error::ProtocolError;
use crate::common::ByteStr;
use crate::phase::TransactionStatus;

/// A type that can be decoded from a postgres backend message
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Postgres backend messages
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    CopyData(CopyData),
    CopyDone(CopyDone),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            /// Get message name from message type.
            ///
            /// Returns `"Unknown"` for unknown message type.
            pub fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }

            pub(crate) fn unexpected(&self, phase: &'static str) -> ProtocolError {
                ProtocolError::unexpected_phase(self.msgtype(), phase)
            }
        }
        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyData,
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(Self::MSGTYPE, $typ));
        }
    };
}

macro_rules! require {
    ($body:ident, $len:expr, $name:literal) => {
        if $body.remaining() < $len {
            return Err(ProtocolError::malformed(concat!($name, " body too short")));
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8; 4],
    },
    /// Specifies that GSSAPI authentication is required.
    GSS,
    /// GSSAPI or SSPI authentication data.
    GSSContinue { data: Bytes },
    /// Specifies that SSPI authentication is required.
    SSPI,
    /// Specifies that SASL authentication is required.
    ///
    /// The message body is a list of SASL authentication mechanisms, in the
    /// server's order of preference, each a nul-terminated string, with a
    /// final nul terminator after the last one.
    SASL { mechanisms: Bytes },
    /// A SASL challenge, mechanism specific.
    SASLContinue { data: Bytes },
    /// SASL outcome "additional data", mechanism specific.
    SASLFinal { data: Bytes },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';

    /// Short mechanism label, for errors and logging.
    pub fn mechanism(&self) -> &'static str {
        match self {
            Authentication::Ok => "trust",
            Authentication::KerberosV5 => "kerberos",
            Authentication::CleartextPassword => "password",
            Authentication::MD5Password { .. } => "md5",
            Authentication::GSS | Authentication::GSSContinue { .. } => "gss",
            Authentication::SSPI => "sspi",
            Authentication::SASL { .. }
            | Authentication::SASLContinue { .. }
            | Authentication::SASLFinal { .. } => "sasl",
        }
    }
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        require!(body, 4, "Authentication");
        let auth = match body.get_i32() {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => {
                require!(body, 4, "AuthenticationMD5Password");
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Authentication::MD5Password { salt }
            }
            7 => Authentication::GSS,
            8 => Authentication::GSSContinue { data: body },
            9 => Authentication::SSPI,
            10 => Authentication::SASL { mechanisms: body },
            11 => Authentication::SASLContinue { data: body },
            12 => Authentication::SASLFinal { data: body },
            auth => return Err(ProtocolError::unknown_auth(auth)),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue
/// CancelRequest messages later.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: i32,
    /// The secret key of this backend.
    pub secret_key: i32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        require!(body, 8, "BackendKeyData");
        Ok(Self {
            process_id: body.get_i32(),
            secret_key: body.get_i32(),
        })
    }
}

/// Identifies the message as a run-time parameter status report
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported
    pub name: ByteStr,
    /// The current value of the parameter
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            name: ByteStr::read_nul(&mut body)?,
            value: ByteStr::read_nul(&mut body)?,
        })
    }
}

/// A warning message. The frontend should display the message.
///
/// The body shares the field layout of [`ErrorResponse`].
#[derive(Debug)]
pub struct NoticeResponse {
    pub body: Bytes,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(NoticeResponse { body })
    }
}

/// Identifies the message as an error
///
/// The message body consists of one or more identified fields, followed by a
/// zero byte as a terminator. Fields can appear in any order.
///
/// For each field there is the following:
///
/// `Byte1` A code identifying the field type; if zero, this is the message
/// terminator and no string follows. Since more field types might be added in
/// future, frontends should silently ignore fields of unrecognized type.
///
/// `String` The field value.
#[derive(Debug)]
pub struct ErrorResponse {
    pub body: Bytes,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { body })
    }
}

/// Identifies the message as a row description
///
/// Carried as the undecoded body; see `row::RowDescription` for the parsed
/// column descriptors.
#[derive(Debug)]
pub struct RowDescription {
    /// Specifies the number of fields in a row (can be zero).
    pub field_len: i16,
    /// Per-field descriptors, undecoded.
    pub body: Bytes,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        require!(body, 2, "RowDescription");
        Ok(Self {
            field_len: body.get_i16(),
            body,
        })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// The number of column values that follow (possibly zero).
    pub field_len: i16,
    /// Length-prefixed column values, undecoded.
    pub body: Bytes,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        require!(body, 2, "DataRow");
        Ok(Self {
            field_len: body.get_i16(),
            body,
        })
    }
}

/// Identifies the message as a command-completed response
///
/// For an INSERT command, the tag is `INSERT oid rows`. For DELETE, UPDATE,
/// MERGE, SELECT, MOVE and FETCH the tag carries the row count as the last
/// word. For a COPY command, the tag is `COPY rows`.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag. This is usually a single word that identifies which
    /// SQL command was completed.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';

    /// Number of rows the completed command handled, `0` when the tag
    /// carries no count.
    pub fn rows_affected(&self) -> u64 {
        let mut words = self.tag.split_whitespace();
        let Some(tag) = words.next() else {
            return 0;
        };
        let Some(rows) = words.next() else {
            return 0;
        };
        match tag {
            // INSERT oid rows; oid is always 0 nowadays
            "INSERT" => words.next().unwrap_or_default(),
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { tag: ByteStr::read_nul(&mut body)? })
    }
}

/// Identifies the message as a protocol version negotiation message.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server for the major
    /// protocol version requested by the client.
    pub minor: i32,
    /// Number of protocol options not recognized by the server.
    pub len: i32,
    /// Then, for each protocol option not recognized by the server, its name.
    pub opt_names: Bytes,
}

impl NegotiateProtocolVersion {
    pub const MSGTYPE: u8 = b'v';
}

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        require!(body, 8, "NegotiateProtocolVersion");
        Ok(Self {
            minor: body.get_i32(),
            len: body.get_i32(),
            opt_names: body,
        })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug)]
pub struct ParameterDescription {
    /// The number of parameters used by the statement (can be zero).
    pub param_len: i16,
    /// Then, for each parameter, the object ID of its data type.
    pub oids: Bytes,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';

    pub fn oids(&self) -> Vec<super::Oid> {
        let mut body = self.oids.clone();
        let mut out = Vec::with_capacity(self.param_len.max(0) as usize);
        while body.remaining() >= 4 {
            out.push(body.get_u32());
        }
        out
    }
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        require!(body, 2, "ParameterDescription");
        Ok(Self {
            param_len: body.get_i16(),
            oids: body,
        })
    }
}

/// ReadyForQuery is sent whenever the backend is ready for a new query cycle.
///
/// Carries the current backend transaction status indicator.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        require!(body, 1, "ReadyForQuery");
        Ok(Self { status: TransactionStatus::from_byte(body.get_u8())? })
    }
}

/// COPY data transfer, backend to frontend.
///
/// Messages sent from the backend always correspond to single data rows.
#[derive(Debug)]
pub struct CopyData {
    pub data: Bytes,
}

impl CopyData {
    pub const MSGTYPE: u8 = b'd';
}

impl BackendProtocol for CopyData {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { data: body })
    }
}

/// Identifies the message as the start of a copy-in (frontend to backend)
/// transfer. The frontend must now send copy-in data.
#[derive(Debug)]
pub struct CopyInResponse {
    /// 0 for textual, 1 for binary overall copy format.
    pub overall_format: i8,
    /// Per-column format codes. All zero in a textual copy.
    pub column_formats: Vec<i16>,
}

impl CopyInResponse {
    pub const MSGTYPE: u8 = b'G';
}

/// Identifies the message as the start of a copy-out (backend to frontend)
/// transfer. Followed by CopyData until CopyDone.
#[derive(Debug)]
pub struct CopyOutResponse {
    /// 0 for textual, 1 for binary overall copy format.
    pub overall_format: i8,
    /// Per-column format codes. All zero in a textual copy.
    pub column_formats: Vec<i16>,
}

impl CopyOutResponse {
    pub const MSGTYPE: u8 = b'H';
}

fn decode_copy_response(body: &mut Bytes) -> Result<(i8, Vec<i16>), ProtocolError> {
    if body.remaining() < 3 {
        return Err(ProtocolError::malformed("copy response body too short"));
    }
    let overall = body.get_i8();
    let columns = body.get_i16().max(0) as usize;
    if body.remaining() < columns * 2 {
        return Err(ProtocolError::malformed("copy response column formats truncated"));
    }
    let mut formats = Vec::with_capacity(columns);
    for _ in 0..columns {
        formats.push(body.get_i16());
    }
    Ok((overall, formats))
}

impl BackendProtocol for CopyInResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let (overall_format, column_formats) = decode_copy_response(&mut body)?;
        Ok(Self { overall_format, column_formats })
    }
}

impl BackendProtocol for CopyOutResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let (overall_format, column_formats) = decode_copy_response(&mut body)?;
        Ok(Self { overall_format, column_formats })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
            $(#[$doc])*
            #[derive(Debug)]
            pub struct $name;

            impl $name {
                pub const MSGTYPE: u8 = $ty;
            }

            impl BackendProtocol for $name {
                fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                    if $name::MSGTYPE != msgtype {
                        return Err(ProtocolError::unexpected($name::MSGTYPE, msgtype));
                    }
                    Ok(Self)
                }
            }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a COPY-complete indicator, backend to frontend.
    struct CopyDone, b'c';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was reached.
    struct PortalSuspended, b's';
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_for_query_carries_transaction_status() {
        let msg = ReadyForQuery::decode(b'Z', Bytes::from_static(b"T")).unwrap();
        assert!(matches!(msg.status, TransactionStatus::InBlock));
        let msg = ReadyForQuery::decode(b'Z', Bytes::from_static(b"I")).unwrap();
        assert!(matches!(msg.status, TransactionStatus::Idle));
        let msg = ReadyForQuery::decode(b'Z', Bytes::from_static(b"E")).unwrap();
        assert!(matches!(msg.status, TransactionStatus::InFailedBlock));
        assert!(ReadyForQuery::decode(b'Z', Bytes::from_static(b"X")).is_err());
    }

    #[test]
    fn command_complete_row_counts() {
        let tag = |s: &'static str| CommandComplete { tag: ByteStr::from_static(s) };
        assert_eq!(tag("INSERT 0 4").rows_affected(), 4);
        assert_eq!(tag("SELECT 10").rows_affected(), 10);
        assert_eq!(tag("COPY 1000").rows_affected(), 1000);
        assert_eq!(tag("CREATE TABLE").rows_affected(), 0);
        assert_eq!(tag("BEGIN").rows_affected(), 0);
    }

    #[test]
    fn copy_in_response_formats() {
        // textual, 3 columns, all text
        let body = Bytes::from_static(&[0, 0, 3, 0, 0, 0, 0, 0, 0]);
        let msg = CopyInResponse::decode(b'G', body).unwrap();
        assert_eq!(msg.overall_format, 0);
        assert_eq!(msg.column_formats, vec![0, 0, 0]);
    }

    #[test]
    fn decode_dispatches_by_type_byte() {
        let msg = BackendMessage::decode(b'1', Bytes::new()).unwrap();
        assert!(matches!(msg, BackendMessage::ParseComplete(_)));
        assert!(BackendMessage::decode(b'@', Bytes::new()).is_err());
    }

    #[test]
    fn backend_key_data_fields() {
        let mut body = bytes::BytesMut::new();
        use bytes::BufMut;
        body.put_i32(1234);
        body.put_i32(5678);
        let msg = BackendKeyData::decode(b'K', body.freeze()).unwrap();
        assert_eq!(msg.process_id, 1234);
        assert_eq!(msg.secret_key, 5678);
    }
}
